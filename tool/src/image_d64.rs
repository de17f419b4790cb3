use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};

use anyhow::Result;
use log::warn;
use util::bitstream::{
    bits_of, bytes_of, find_sync_mark, split_at_sync_marks, to_bit_stream, BitStreamCollector,
};
use util::c64_geometry::{get_track_settings, HALF_TRACK_COUNT, SPEED_ZONE_BYTE_LENGTH};
use util::gcr::{decode_gcr_bytes, to_gcr_stream};

use crate::error::ImageError;
use crate::halftrack::HalfTrackImage;

pub const BYTES_PER_SECTOR: usize = 256;

// BAM sector offsets 162 & 163 hold the disk id
const DISK_ID_OFFSET: usize = 0x165a2;

const GCR_GAP: u8 = 0x55;
const HEADER_GAP_SIZE: usize = 9;
const EMPTY_BLOCK: [u8; BYTES_PER_SECTOR] = [0; BYTES_PER_SECTOR];

// Sector statuses of the extended logical format, as the drive controller
// reports them
const STATUS_OK: u8 = 0;
const STATUS_NO_HEADER: u8 = 20;
const STATUS_NO_SYNC: u8 = 21;
const STATUS_NO_DATA: u8 = 22;
const STATUS_BAD_DATA: u8 = 23;
const STATUS_BAD_HEADER: u8 = 27;
const STATUS_ID_MISMATCH: u8 = 29;

struct LogicalLayout {
    track_count: usize,
    error_block_offset: Option<usize>,
}

fn layout_for_size(size: usize) -> Result<LogicalLayout, ImageError> {
    let (track_count, error_block_offset) = match size {
        174848 => (35, None),
        175531 => (35, Some(174848)),
        196608 => (40, None),
        197376 => (40, Some(196608)),
        205312 => (42, None),
        206114 => (42, Some(205312)),
        // two sided images
        349696 => (70, None),
        351062 => (70, Some(349696)),
        _ => return Err(ImageError::UnsupportedSize(size)),
    };
    Ok(LogicalLayout {
        track_count,
        error_block_offset,
    })
}

pub fn parse_d64_image(buffer: &[u8]) -> Result<HalfTrackImage> {
    let layout = layout_for_size(buffer.len())?;
    let mut track_count = layout.track_count;
    if track_count > 42 {
        warn!("no double sided disk support yet, ignoring tracks above 35");
        track_count = 35;
    }

    // read in reverse order, the drive shifts the second byte out first
    let disk_id = [buffer[DISK_ID_OFFSET + 1], buffer[DISK_ID_OFFSET]];

    let mut image = HalfTrackImage::new();
    let mut data_offset = 0;
    let mut status_offset = layout.error_block_offset.unwrap_or(0);

    for track in 1..=track_count {
        let settings = get_track_settings(track);
        let sector_count = settings.sectors as usize;

        let track_data = &buffer[data_offset..data_offset + sector_count * BYTES_PER_SECTOR];
        data_offset += sector_count * BYTES_PER_SECTOR;

        let statuses = match layout.error_block_offset {
            Some(_) => {
                let statuses = buffer[status_offset..status_offset + sector_count].to_vec();
                status_offset += sector_count;
                statuses
            }
            None => vec![STATUS_OK; sector_count],
        };

        if statuses.contains(&STATUS_NO_SYNC) {
            if statuses.iter().all(|status| *status == STATUS_NO_SYNC) {
                // no sync on the whole track? leave it blank
                continue;
            }
            warn!("track {track}: mix of NO SYNC and other sector statuses, ignoring NO SYNC");
        }

        let trackbuf = assemble_gcr_track(track, track_data, &statuses, disk_id);
        image.insert((track - 1) * 2, trackbuf, settings.speed);
    }

    Ok(image)
}

/// Builds the GCR bit stream of one track out of its sector data, injecting
/// the defects the status table asks for.
fn assemble_gcr_track(
    track: usize,
    track_data: &[u8],
    statuses: &[u8],
    disk_id: [u8; 2],
) -> Vec<u8> {
    let settings = get_track_settings(track);
    let bad_disk_id = [disk_id[0], disk_id[1] ^ 1];

    let mut trackbuf: Vec<u8> = Vec::new();
    let collector = RefCell::new(BitStreamCollector::new(|byte| trackbuf.push(byte)));
    let feed_raw = |word| to_bit_stream(word, |cell| collector.borrow_mut().feed(cell));
    let feed_gcr = |word| to_gcr_stream(word, |cell| collector.borrow_mut().feed(cell));

    for (sector, block) in track_data.chunks_exact(BYTES_PER_SECTOR).enumerate() {
        let status = statuses[sector];
        let block_id = if status == STATUS_ID_MISMATCH {
            bad_disk_id
        } else {
            disk_id
        };

        // Header
        for _ in 0..5 {
            feed_raw(0xff);
        }

        let mut header_checksum = sector as u8 ^ track as u8 ^ block_id[0] ^ block_id[1];
        if status == STATUS_BAD_HEADER {
            header_checksum ^= 1;
        }
        feed_gcr(if status == STATUS_NO_HEADER { 0x00 } else { 0x08 });
        feed_gcr(header_checksum);
        feed_gcr(sector as u8);
        feed_gcr(track as u8);
        feed_gcr(block_id[0]);
        feed_gcr(block_id[1]);
        // up to a multiple of 4 bytes for GCR encoding
        feed_gcr(0x0f);
        feed_gcr(0x0f);

        for _ in 0..HEADER_GAP_SIZE {
            feed_raw(GCR_GAP);
        }

        // Data
        for _ in 0..5 {
            feed_raw(0xff);
        }

        feed_gcr(if status == STATUS_NO_DATA { 0x00 } else { 0x07 });
        let mut data_checksum: u8 = if status == STATUS_BAD_DATA { 1 } else { 0 };
        for byte in block {
            feed_gcr(*byte);
            data_checksum ^= *byte;
        }
        feed_gcr(data_checksum);
        // zero padding up to a multiple of 4, as emulators write it
        feed_gcr(0x00);
        feed_gcr(0x00);

        for _ in 0..settings.gap_size {
            feed_raw(GCR_GAP);
        }
    }

    let capacity = SPEED_ZONE_BYTE_LENGTH[settings.speed as usize];
    if trackbuf.len() < capacity {
        trackbuf.resize(capacity, GCR_GAP);
    }
    trackbuf
}

pub fn write_d64_image(image: &HalfTrackImage) -> Result<Vec<u8>> {
    let track_count = emitted_track_count(image);
    let mut output = Vec::new();

    for track in 1..=track_count {
        // only full tracks, the logical format cannot represent half steps
        let half_track = (track - 1) * 2;
        let settings = get_track_settings(track);
        let sector_count = settings.sectors as usize;

        let (data, speed) = image.data_and_speed(half_track);
        let Some(track_gcr) = data else {
            output.resize(output.len() + sector_count * BYTES_PER_SECTOR, 0);
            continue;
        };

        if speed != settings.speed {
            return Err(ImageError::NonStandardSpeed {
                half_track,
                speed,
                standard: settings.speed,
            }
            .into());
        }

        output.extend_from_slice(&recover_track_sectors(track, track_gcr));
    }

    Ok(output)
}

/// Smallest of the recognized layouts holding every present half track.
fn emitted_track_count(image: &HalfTrackImage) -> usize {
    let highest_track = (0..HALF_TRACK_COUNT)
        .step_by(2)
        .filter(|half_track| image.get(*half_track).is_some())
        .map(|half_track| half_track / 2 + 1)
        .max()
        .unwrap_or(0);

    if highest_track <= 35 {
        35
    } else if highest_track <= 40 {
        40
    } else {
        42
    }
}

/// Recovers the sector data of one track from its GCR bit stream. Defective
/// blocks degrade to empty sectors, never to an error.
fn recover_track_sectors(track: usize, track_gcr: &[u8]) -> Vec<u8> {
    let half_track = (track - 1) * 2;
    let settings = get_track_settings(track);
    let sector_count = settings.sectors as usize;
    let empty_track = vec![0; sector_count * BYTES_PER_SECTOR];

    // trailing zeroes are unwritten space, not cells
    let significant = track_gcr.len() - track_gcr.iter().rev().take_while(|b| **b == 0).count();
    let mut cells = bits_of(&track_gcr[..significant]);

    // align the track to the beginning of its first sync mark
    let Some(sync_position) = find_sync_mark(&cells) else {
        warn!("half track {half_track}: no sync mark, assuming empty");
        return empty_track;
    };
    cells.rotate_left(sync_position);

    let mut chunks: VecDeque<Vec<u8>> = split_at_sync_marks(&cells)
        .iter()
        .map(|fragment| decode_gcr_bytes(&bytes_of(fragment)))
        .collect();

    // A track starting inside a sector begins with a data block. Move it to
    // the end of the list, behind its header.
    if chunks.front().is_some_and(|chunk| chunk.first() == Some(&0x07)) {
        let orphan = chunks.pop_front().unwrap();
        chunks.push_back(orphan);
    }

    let mut disk_dict: BTreeMap<[u8; 2], BTreeMap<u8, Vec<Vec<u8>>>> = BTreeMap::new();

    while let Some(chunk) = chunks.pop_front() {
        // the 0x55 gap behind a header decodes to 0x0f bytes
        let header_len = chunk.len() - chunk.iter().rev().take_while(|b| **b == 0x0f).count();
        let header = &chunk[..header_len];

        if header.first() != Some(&0x08) || header.len() < 6 {
            warn!("half track {half_track}: not a (complete) block header: {chunk:02x?}");
            continue;
        }
        let checksum = header[1];
        let sector = header[2];
        let header_track = header[3];
        let id = [header[4], header[5]];

        if header_track as usize != track {
            warn!("half track {half_track}: got a block claiming to be from track {header_track}");
            continue;
        }
        if checksum != sector ^ header_track ^ id[0] ^ id[1] {
            warn!(
                "half track {half_track}: bad header checksum: {checksum:02x} != {:02x} ^ {:02x} ^ {:02x} ^ {:02x}",
                sector, header_track, id[0], id[1]
            );
            continue;
        }

        let Some(data_chunk) = chunks.pop_front() else {
            warn!("half track {half_track}: header without a following data block");
            break;
        };
        if data_chunk.first() != Some(&0x07) || data_chunk.len() < BYTES_PER_SECTOR + 2 {
            warn!("half track {half_track}: not a (complete) data block: {data_chunk:02x?}");
            continue;
        }
        let data = &data_chunk[1..1 + BYTES_PER_SECTOR];
        let mut data_checksum = 0;
        for byte in data {
            data_checksum ^= *byte;
        }
        if data_checksum != data_chunk[1 + BYTES_PER_SECTOR] {
            warn!(
                "half track {half_track}: bad data checksum: {:02x} != {data_checksum:02x}",
                data_chunk[1 + BYTES_PER_SECTOR]
            );
            continue;
        }

        disk_dict
            .entry(id)
            .or_default()
            .entry(sector)
            .or_default()
            .push(data.to_vec());
    }

    // A reformatted disk may keep a few headers of the previous disk alive
    // inside the gaps. Go with the id holding the most sectors.
    let Some(sector_dict) = disk_dict.values().max_by_key(|sectors| sectors.len()) else {
        warn!("half track {half_track}: no valid block found, assuming empty");
        return empty_track;
    };

    let mut result = Vec::with_capacity(sector_count * BYTES_PER_SECTOR);
    for sector in 0..sector_count as u8 {
        match sector_dict.get(&sector).map(|copies| copies.as_slice()) {
            // an aliased sector has several valid copies which cannot all
            // be right, it degrades to an empty block like a missing one
            Some([data]) => result.extend_from_slice(data),
            _ => result.extend_from_slice(&EMPTY_BLOCK),
        }
    }
    result
}
