use anyhow::{ensure, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use util::c64_geometry::{HALF_TRACK_COUNT, SPEED_ZONE_BYTE_LENGTH};

use crate::error::ImageError;
use crate::halftrack::HalfTrackImage;

/// Per half track payload slot, the smallest power of two above the largest
/// speed zone capacity.
const TRACK_SLOT_LENGTH: usize = 0x2000;
const METADATA_OFFSET: usize = TRACK_SLOT_LENGTH * HALF_TRACK_COUNT;
/// One LBA for the metadata block: 84 * 8 < 0x400
const FILE_SIZE: usize = METADATA_OFFSET + 0x400;
const METADATA_RECORD_SIZE: usize = 8;

// The drive shifts a 1 after 2 * (16 - zone) cycles of its 16 MHz clock and
// times out on a 0 after twice that.
const STANDARD_ONE_DELAY: [u32; 4] = [32, 30, 28, 26];
const STANDARD_ZERO_DELAY: [u32; 4] = [64, 60, 56, 52];
const ONE_SHIFT_CLOCK_CYCLE_COUNT: u32 = 32;

// Read pulses pass a 9602 one-shot wired with 22 kOhm / 330 pF. Its output
// pulse (formula from the Fairchild datasheet) must outlast a 1 cell but
// stay inside a 0 cell; with typical component values that is about 45
// cycles of the 16 MHz clock.
const TIME_DOMAIN_FILTER_PULSE_NS: f64 = 0.37 * 22.0 * 330.0 * (1.0 + 1.0 / 22.0);
const TIME_DOMAIN_FILTER_PULSE_CYCLES: f64 = TIME_DOMAIN_FILTER_PULSE_NS * 1e-9 * 16e6;

pub fn parse_i64_image(buffer: &[u8]) -> Result<HalfTrackImage> {
    ensure!(
        buffer.len() == FILE_SIZE,
        "I64 image has wrong size: {} instead of {FILE_SIZE}",
        buffer.len()
    );

    let mut image = HalfTrackImage::new();

    for half_track in 0..HALF_TRACK_COUNT {
        let record = &buffer[METADATA_OFFSET + half_track * METADATA_RECORD_SIZE..][..8];
        let speed = record[0] >> 6;
        let track_length = BigEndian::read_u16(&record[2..4]) as usize;

        let slot = &buffer[half_track * TRACK_SLOT_LENGTH..][..TRACK_SLOT_LENGTH];
        if slot.iter().all(|byte| *byte == 0) {
            continue;
        }
        image.insert(
            half_track,
            slot[..track_length.min(TRACK_SLOT_LENGTH)].to_vec(),
            speed,
        );
    }

    Ok(image)
}

pub fn write_i64_image(image: &HalfTrackImage) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(FILE_SIZE);
    let mut metadata = Vec::with_capacity(HALF_TRACK_COUNT * METADATA_RECORD_SIZE);
    let mut previous_track_length: Option<usize> = None;

    for half_track in 0..HALF_TRACK_COUNT {
        let (data, speed) = image.data_and_speed(half_track);
        let (track_data, track_length) = match data {
            Some(track_data) if !track_data.is_empty() => {
                ensure!(
                    track_data.len() <= TRACK_SLOT_LENGTH,
                    ImageError::InvariantViolation(format!(
                        "half track {half_track} does not fit an I64 slot: {} > {TRACK_SLOT_LENGTH}",
                        track_data.len()
                    ))
                );
                (track_data, track_data.len())
            }
            // A blank track is written as silence but keeps the length of
            // its predecessor so the adjacent length ratios stay sane.
            _ => (
                &[][..],
                previous_track_length.unwrap_or(TRACK_SLOT_LENGTH),
            ),
        };

        let zone_capacity = SPEED_ZONE_BYTE_LENGTH[speed as usize];
        let delay =
            zone_capacity as f64 / track_length as f64 * STANDARD_ZERO_DELAY[speed as usize] as f64;
        let cell_limit = STANDARD_ONE_DELAY[speed as usize] + STANDARD_ZERO_DELAY[speed as usize];
        ensure!(
            TIME_DOMAIN_FILTER_PULSE_CYCLES < delay && delay < cell_limit as f64,
            ImageError::InvariantViolation(format!(
                "half track {half_track}: clock delay {delay:.2} outside ({TIME_DOMAIN_FILTER_PULSE_CYCLES:.2}, {cell_limit}) for zone {speed}"
            ))
        );
        // 6.8 fixed point, split in the integer domain to dodge float
        // rounding on the fraction
        let delay_scaled =
            zone_capacity * STANDARD_ZERO_DELAY[speed as usize] as usize * 256 / track_length;
        let delay_integer = (delay_scaled >> 8) as u32;
        let delay_fractional = (delay_scaled & 0xff) as u8;

        let previous_length = previous_track_length.unwrap_or(track_length);
        let (next_data, _) = image.data_and_speed(half_track + 1);
        let next_length = match next_data {
            Some(next_data) if !next_data.is_empty() => next_data.len(),
            _ => track_length,
        };

        metadata.push(speed << 6 | (delay_integer - ONE_SHIFT_CLOCK_CYCLE_COUNT) as u8);
        metadata.push(delay_fractional);
        metadata.write_u16::<BigEndian>(track_length as u16)?;
        metadata.write_u16::<BigEndian>(length_ratio(previous_length, track_length, half_track)?)?;
        metadata.write_u16::<BigEndian>(length_ratio(next_length, track_length, half_track)?)?;

        output.extend_from_slice(track_data);
        output.resize((half_track + 1) * TRACK_SLOT_LENGTH, 0);
        previous_track_length = Some(track_length);
    }

    ensure!(
        output.len() == METADATA_OFFSET,
        ImageError::InvariantViolation(format!(
            "I64 track payloads end at {} instead of {METADATA_OFFSET}",
            output.len()
        ))
    );
    output.append(&mut metadata);
    output.resize(FILE_SIZE, 0);
    Ok(output)
}

/// 1.15 fixed point ratio between a neighbouring track's length and this one.
fn length_ratio(other_length: usize, track_length: usize, half_track: usize) -> Result<u16> {
    let ratio = (other_length as f64 / track_length as f64 * 32768.0).round();
    ensure!(
        ratio <= f64::from(u16::MAX),
        ImageError::InvariantViolation(format!(
            "half track {half_track}: length ratio {other_length}/{track_length} does not fit 1.15 fixed point"
        ))
    );
    Ok(ratio as u16)
}
