use lazy_static::lazy_static;

pub const ATTEN_TABLE_SIZE: usize = 1441;
pub const CENT_TABLE_SIZE: usize = 1200;

lazy_static! {
    // -200 instead of -100 for compatibility with the common centibel bend
    static ref ATTEN_TO_AMP_TABLE: [f32; ATTEN_TABLE_SIZE] = {
        let mut table = [0.0f32; ATTEN_TABLE_SIZE];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = 10.0f32.powf(i as f32 / -200.0);
        }
        table
    };
    static ref CENT_TO_HERTZ_TABLE: [f32; CENT_TABLE_SIZE] = {
        let mut table = [0.0f32; CENT_TABLE_SIZE];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = 6.875 * (i as f32 / 1200.0).exp2();
        }
        table
    };
}

pub fn attenuation_to_amplitude(atten: f32) -> f32 {
    if atten <= 0.0 {
        1.0
    } else if atten >= ATTEN_TABLE_SIZE as f32 {
        0.0
    } else {
        ATTEN_TO_AMP_TABLE[atten as usize]
    }
}

pub fn amplitude_to_attenuation(amp: f32) -> f32 {
    -200.0 * amp.log10()
}

/// MIDI key number (fractional keys allowed) to frequency in hertz, octave
/// folded through the cent table.
pub fn key_to_hertz(key: f32) -> f32 {
    if key < 0.0 {
        return 1.0;
    }

    let cents = (key * 100.0) as i32;
    let mut offset = 300i32;
    let mut ratio = 1.0f32;
    let mut threshold = 900i32;
    while threshold <= 14100 {
        if cents < threshold {
            return ratio * CENT_TO_HERTZ_TABLE[(cents + offset) as usize];
        }
        offset -= 1200;
        ratio *= 2.0;
        threshold += 1200;
    }

    1.0
}

pub fn time_cent_to_second(tc: f32) -> f32 {
    (tc / 1200.0).exp2()
}

pub fn absolute_cent_to_hertz(ac: f32) -> f32 {
    8.176 * (ac / 1200.0).exp2()
}

pub fn concave_curve(x: f32) -> f32 {
    if x <= 0.0 {
        0.0
    } else if x >= 1.0 {
        1.0
    } else {
        2.0 * amplitude_to_attenuation(1.0 - x) / 960.0
    }
}

pub fn convex_curve(x: f32) -> f32 {
    if x <= 0.0 {
        0.0
    } else if x >= 1.0 {
        1.0
    } else {
        1.0 - 2.0 * amplitude_to_attenuation(x) / 960.0
    }
}
