use std::collections::BTreeSet;

use anyhow::{ensure, Context, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::warn;
use util::c64_geometry::HALF_TRACK_COUNT;

use crate::error::ImageError;
use crate::halftrack::HalfTrackImage;

// http://www.unusedino.de/ec64/technical/formats/g64.html

const G64_MAGIC: &[u8; 9] = b"GCR-1541\0";
const HEADER_SIZE: usize = G64_MAGIC.len() + 1 + 2;

/// Longest half track the format officially allows, used on write.
const WRITE_MAX_TRACK_LENGTH: usize = 7928;

const GCR_GAP: u8 = 0x55;

pub fn parse_g64_image(buffer: &[u8]) -> Result<HalfTrackImage> {
    ensure!(
        buffer.len() >= HEADER_SIZE && &buffer[..G64_MAGIC.len()] == G64_MAGIC,
        ImageError::BadMagic
    );
    let track_count = buffer[9] as usize;
    let max_track_length = LittleEndian::read_u16(&buffer[10..12]) as usize;

    let offset_table = buffer
        .get(HEADER_SIZE..HEADER_SIZE + track_count * 8)
        .context("G64 image too short for its track tables")?;
    let (data_offsets, speed_offsets) = offset_table.split_at(track_count * 4);

    let mut image = HalfTrackImage::new();

    for half_track in 0..track_count {
        let data_offset = LittleEndian::read_u32(&data_offsets[half_track * 4..]) as usize;
        if data_offset == 0 {
            continue;
        }
        if half_track >= HALF_TRACK_COUNT {
            warn!("ignoring half track {half_track}, only {HALF_TRACK_COUNT} are addressable");
            continue;
        }

        let length_field = buffer
            .get(data_offset..data_offset + 2)
            .with_context(|| format!("half track {half_track} data offset out of bounds"))?;
        let track_length = LittleEndian::read_u16(length_field) as usize;
        ensure!(
            track_length <= max_track_length,
            "half track {half_track} is longer than the stated maximum: {track_length} > {max_track_length}"
        );
        let track_data = buffer
            .get(data_offset + 2..data_offset + 2 + track_length)
            .with_context(|| format!("half track {half_track} data out of bounds"))?;

        let speed_field = LittleEndian::read_u32(&speed_offsets[half_track * 4..]) as usize;
        let speed = if speed_field <= 3 {
            speed_field as u8
        } else {
            read_speed_table(buffer, speed_field, track_length, half_track)?
        };

        image.insert(half_track, track_data.to_vec(), speed);
    }

    Ok(image)
}

/// Legacy per-byte speed tables cannot be represented, a single zone per
/// half track has to do. Mixed zones degrade to the fastest one in use.
fn read_speed_table(
    buffer: &[u8],
    table_offset: usize,
    track_length: usize,
    half_track: usize,
) -> Result<u8> {
    let table = buffer
        .get(table_offset..table_offset + track_length.div_ceil(4))
        .with_context(|| format!("half track {half_track} speed table out of bounds"))?;

    let mut speed_set = BTreeSet::new();
    for data_byte_index in 0..track_length {
        // 2 bits per data byte, packed from the most significant end
        let speed_byte = table[data_byte_index / 4];
        let shift = 6 - 2 * (data_byte_index % 4);
        speed_set.insert((speed_byte >> shift) & 0x3);
    }

    if speed_set.len() > 1 {
        warn!("half track {half_track}: multiple speeds used: {speed_set:?}");
    }
    Ok(*speed_set.iter().next_back().unwrap())
}

pub fn write_g64_image(image: &HalfTrackImage) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    output.extend_from_slice(G64_MAGIC);
    output.push(HALF_TRACK_COUNT as u8);
    output.write_u16::<LittleEndian>(WRITE_MAX_TRACK_LENGTH as u16)?;

    let table_end = HEADER_SIZE + HALF_TRACK_COUNT * 8;
    let mut current_offset = table_end;
    let mut speeds = Vec::with_capacity(HALF_TRACK_COUNT);
    let mut data_offsets = Vec::with_capacity(HALF_TRACK_COUNT);

    for half_track in 0..HALF_TRACK_COUNT {
        let (data, speed) = image.data_and_speed(half_track);
        let offset = match data {
            Some(track_data) => {
                ensure!(
                    track_data.len() <= WRITE_MAX_TRACK_LENGTH,
                    ImageError::InvariantViolation(format!(
                        "half track {half_track} does not fit a G64 track: {} > {WRITE_MAX_TRACK_LENGTH}",
                        track_data.len()
                    ))
                );
                let offset = current_offset;
                // +2 for the length field in front of each track
                current_offset += WRITE_MAX_TRACK_LENGTH + 2;
                offset
            }
            None => 0,
        };
        data_offsets.push(offset);
        speeds.push(speed);
        output.write_u32::<LittleEndian>(offset as u32)?;
    }
    for speed in speeds {
        output.write_u32::<LittleEndian>(speed as u32)?;
    }
    ensure!(
        output.len() == table_end,
        ImageError::InvariantViolation(format!(
            "G64 track table ends at {} instead of {table_end}",
            output.len()
        ))
    );

    for half_track in 0..HALF_TRACK_COUNT {
        let Some(track) = image.get(half_track) else {
            continue;
        };
        ensure!(
            output.len() == data_offsets[half_track],
            ImageError::InvariantViolation(format!(
                "half track {half_track} lands at {} instead of its recorded offset {}",
                output.len(),
                data_offsets[half_track]
            ))
        );
        output.write_u16::<LittleEndian>(track.data.len() as u16)?;
        output.extend_from_slice(&track.data);
        // 0x55 is valid GCR and naturally present behind a track
        output.resize(data_offsets[half_track] + 2 + WRITE_MAX_TRACK_LENGTH, GCR_GAP);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> HalfTrackImage {
        let mut image = HalfTrackImage::new();
        image.insert(0, vec![0xff, 0x55, 0x2a, 0x91], 3);
        image.insert(17, (0..200).map(|i| i as u8 | 1).collect(), 3);
        image.insert(40, vec![0x5a; 7142], 2);
        image
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let first = write_g64_image(&sample_image()).unwrap();
        let reread = parse_g64_image(&first).unwrap();
        assert_eq!(reread.len(), 3);

        let second = write_g64_image(&reread).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn layout_of_written_image() {
        let output = write_g64_image(&sample_image()).unwrap();

        assert_eq!(&output[..9], G64_MAGIC);
        assert_eq!(output[9], 84);
        assert_eq!(LittleEndian::read_u16(&output[10..12]), 7928);

        // three tracks, each 7930 bytes behind the tables
        assert_eq!(output.len(), 12 + 84 * 8 + 3 * 7930);

        let first_offset = LittleEndian::read_u32(&output[12..16]) as usize;
        assert_eq!(first_offset, 12 + 84 * 8);
        assert_eq!(LittleEndian::read_u16(&output[first_offset..]), 4);
        assert_eq!(
            &output[first_offset + 2..first_offset + 6],
            &[0xff, 0x55, 0x2a, 0x91]
        );
        // 0x55 fill up to the track slot size
        assert_eq!(output[first_offset + 6], 0x55);

        // blank half track 1: offset zero, default speed zone
        assert_eq!(LittleEndian::read_u32(&output[16..20]), 0);
        let speed_table_start = 12 + 84 * 4;
        assert_eq!(LittleEndian::read_u32(&output[speed_table_start + 4..]), 3);
        // present half track 40 carries its own zone
        assert_eq!(
            LittleEndian::read_u32(&output[speed_table_start + 40 * 4..]),
            2
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = parse_g64_image(b"GCR-1581\0 no").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageError>(),
            Some(ImageError::BadMagic)
        ));

        let err = parse_g64_image(&[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageError>(),
            Some(ImageError::BadMagic)
        ));
    }

    #[test]
    fn per_byte_speed_table_degrades_to_fastest_zone() {
        // one half track of 5 bytes with a speed table at offset 28
        let mut buffer = Vec::new();
        buffer.extend_from_slice(G64_MAGIC);
        buffer.push(1);
        buffer.write_u16::<LittleEndian>(7928).unwrap();
        buffer.write_u32::<LittleEndian>(20).unwrap(); // track data
        buffer.write_u32::<LittleEndian>(27).unwrap(); // speed table
        buffer.write_u16::<LittleEndian>(5).unwrap();
        buffer.extend_from_slice(&[0x55; 5]);
        // zones 2 3 2 2 | 3 x x x
        buffer.push(0b10_11_10_10);
        buffer.push(0b11_00_00_00);

        let image = parse_g64_image(&buffer).unwrap();
        assert_eq!(image.get(0).unwrap().speed, 3);
    }

    #[test]
    fn uniform_speed_table_keeps_its_zone() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(G64_MAGIC);
        buffer.push(1);
        buffer.write_u16::<LittleEndian>(7928).unwrap();
        buffer.write_u32::<LittleEndian>(20).unwrap();
        buffer.write_u32::<LittleEndian>(26).unwrap();
        buffer.write_u16::<LittleEndian>(4).unwrap();
        buffer.extend_from_slice(&[0x55; 4]);
        buffer.push(0b01_01_01_01);

        let image = parse_g64_image(&buffer).unwrap();
        assert_eq!(image.get(0).unwrap().speed, 1);
    }

    #[test]
    fn overlong_track_violates_the_format() {
        let mut image = HalfTrackImage::new();
        image.insert(0, vec![0x55; 8000], 3);
        let err = write_g64_image(&image).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageError>(),
            Some(ImageError::InvariantViolation(_))
        ));
    }

    #[test]
    fn oversized_track_index_is_ignored() {
        // 85 declared half tracks, the last one with data
        let mut buffer = Vec::new();
        buffer.extend_from_slice(G64_MAGIC);
        buffer.push(85);
        buffer.write_u16::<LittleEndian>(7928).unwrap();
        let table_end = 12 + 85 * 8;
        for half_track in 0..85u32 {
            let offset = if half_track == 84 { table_end as u32 } else { 0 };
            buffer.write_u32::<LittleEndian>(offset).unwrap();
        }
        for _ in 0..85u32 {
            buffer.write_u32::<LittleEndian>(0).unwrap();
        }
        buffer.write_u16::<LittleEndian>(3).unwrap();
        buffer.extend_from_slice(&[0x55; 3]);

        let image = parse_g64_image(&buffer).unwrap();
        assert!(image.is_empty());
    }
}
