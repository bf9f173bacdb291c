use std::fs::{File, OpenOptions};
use std::io::Seek;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn open_file_overwrite_rw<P: AsRef<Path>>(path: P) -> Result<File> {
    let mut file = OpenOptions::new()
        .append(false)
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("could not open {}", path.as_ref().display()))?;
    file.set_len(0)?;
    file.seek(std::io::SeekFrom::Start(0))?;
    Ok(file)
}

pub fn get_final_output_folder(output_folder: &Option<PathBuf>) -> Result<PathBuf> {
    match output_folder {
        Some(folder) => {
            if std::fs::metadata(folder)?.is_dir() {
                Ok(folder.clone())
            } else {
                bail!("output path must be a folder");
            }
        }
        None => Ok(std::env::current_dir()?),
    }
}

pub fn valid_file_of_type<P: AsRef<Path>>(path: P, extension: &str) -> bool {
    let Ok(metadata) = std::fs::metadata(&path) else {
        return false;
    };
    metadata.is_file()
        && path
            .as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(extension))
            .unwrap_or(false)
}

/// Expand an input glob into `(input, output)` path pairs, skipping entries
/// that are not files of the expected type.
pub fn get_input_output_pairs(
    input_glob: &str,
    source_file_format: &str,
    output_folder: &Path,
    change_ext: &str,
) -> Vec<(PathBuf, PathBuf)> {
    glob::glob(input_glob)
        .expect("Failed to read glob pattern")
        .filter_map(|entry| match entry {
            Ok(path) => {
                if !valid_file_of_type(&path, source_file_format) {
                    println!("Skipping {}!", path.display());
                    return None;
                }
                let input_file_name = path.file_name()?;
                let mut output_path = output_folder.to_path_buf();
                output_path.push(input_file_name);
                output_path.set_extension(change_ext);
                Some((path, output_path))
            }
            Err(e) => {
                println!("{:?}", e);
                None
            }
        })
        .collect()
}
