/// Half tracks addressable by the drive mechanics. Logical track n sits at
/// half track 2 * (n - 1).
pub const HALF_TRACK_COUNT: usize = 84;

/// Bytes passing under the head during one rotation, per speed zone.
/// Zone 3 is the fastest and outermost, zone 0 the slowest and innermost.
pub const SPEED_ZONE_BYTE_LENGTH: [usize; 4] = [6250, 6666, 7142, 7692];

pub struct TrackConfiguration {
    pub sectors: u8,
    pub gap_size: usize,
    pub speed: u8,
}

#[must_use]
pub fn get_track_settings(track: usize) -> TrackConfiguration {
    assert_ne!(track, 0, "We are starting with 1 here!");
    if track <= 17 {
        TrackConfiguration {
            sectors: 21,
            gap_size: 8,
            speed: 3,
        }
    } else if track <= 24 {
        TrackConfiguration {
            sectors: 19,
            gap_size: 17,
            speed: 2,
        }
    } else if track <= 30 {
        TrackConfiguration {
            sectors: 18,
            gap_size: 12,
            speed: 1,
        }
    } else {
        TrackConfiguration {
            sectors: 17,
            gap_size: 9,
            speed: 0,
        }
    }
}

#[must_use]
pub fn default_speed(half_track: usize) -> u8 {
    get_track_settings(half_track / 2 + 1).speed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_speed_zone_bands() {
        for half_track in 0..HALF_TRACK_COUNT {
            let expected = match half_track {
                0..=33 => 3,
                34..=47 => 2,
                48..=59 => 1,
                _ => 0,
            };
            assert_eq!(default_speed(half_track), expected, "{half_track}");
        }
    }

    #[test]
    fn assembled_track_fits_its_zone() {
        // sync + gcr header + gap + sync + gcr data + post data gap, in bits
        for track in 1..=42 {
            let settings = get_track_settings(track);
            let sector_bits = 40 + 8 * 10 + 9 * 8 + 40 + 260 * 10 + settings.gap_size * 8;
            assert_eq!(sector_bits % 8, 0);
            let track_bytes = settings.sectors as usize * sector_bits / 8;
            assert!(track_bytes <= SPEED_ZONE_BYTE_LENGTH[settings.speed as usize]);
        }
    }
}
