use crate::Bit;
use alloc::vec::Vec;

/// Number of consecutive 1 bits which form a sync mark on a GCR track.
pub const SYNC_MARK_LENGTH: usize = 10;

pub struct BitStreamCollector<T>
where
    T: FnMut(u8),
{
    sink: T,
    bit_i: u8,
    working_byte: u8,
}

impl<T> BitStreamCollector<T>
where
    T: FnMut(u8),
{
    pub fn new(sink: T) -> Self {
        Self {
            sink,
            bit_i: 0,
            working_byte: 0,
        }
    }

    pub fn feed(&mut self, cell: Bit) {
        self.working_byte <<= 1;
        if cell.0 {
            self.working_byte |= 1;
        }
        self.bit_i += 1;
        if self.bit_i == 8 {
            self.bit_i = 0;
            (self.sink)(self.working_byte);
        }
    }
}

pub fn to_bit_stream<T>(mut inval: u8, mut sink: T)
where
    T: FnMut(Bit),
{
    for _ in 0..8 {
        sink(Bit((inval & 0x80) != 0));
        inval <<= 1;
    }
}

/// Expands bytes to their MSB-first cell sequence for bit-level track surgery.
pub fn bits_of(bytes: &[u8]) -> Vec<Bit> {
    let mut cells = Vec::with_capacity(bytes.len() * 8);
    for byte in bytes {
        to_bit_stream(*byte, |cell| cells.push(cell));
    }
    cells
}

/// Repacks cells to bytes. A trailing partial byte is padded with 1 bits.
pub fn bytes_of(cells: &[Bit]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(cells.len().div_ceil(8));
    let mut collector = BitStreamCollector::new(|byte| bytes.push(byte));
    for cell in cells {
        collector.feed(*cell);
    }
    let padding = cells.len() % 8;
    if padding != 0 {
        for _ in padding..8 {
            collector.feed(Bit(true));
        }
    }
    bytes
}

/// Position of the first run of at least [`SYNC_MARK_LENGTH`] 1 bits.
pub fn find_sync_mark(cells: &[Bit]) -> Option<usize> {
    let mut run = 0;
    for (i, cell) in cells.iter().enumerate() {
        if cell.0 {
            run += 1;
            if run == SYNC_MARK_LENGTH {
                return Some(i + 1 - SYNC_MARK_LENGTH);
            }
        } else {
            run = 0;
        }
    }
    None
}

/// Splits a track into the fragments lying between sync marks.
///
/// Every maximal run of at least [`SYNC_MARK_LENGTH`] 1 bits acts as a
/// separator. Stray 1 bits touching a fragment edge belong to no codeword
/// and are dropped, as are empty fragments.
pub fn split_at_sync_marks(cells: &[Bit]) -> Vec<Vec<Bit>> {
    let mut fragments: Vec<Vec<Bit>> = Vec::new();
    fragments.push(Vec::new());
    let mut pending_ones = 0;

    for cell in cells {
        if cell.0 {
            pending_ones += 1;
            continue;
        }
        if pending_ones >= SYNC_MARK_LENGTH {
            fragments.push(Vec::new());
        } else if pending_ones > 0 {
            let current = fragments.last_mut().unwrap();
            if !current.is_empty() {
                for _ in 0..pending_ones {
                    current.push(Bit(true));
                }
            }
        }
        pending_ones = 0;
        fragments.last_mut().unwrap().push(Bit(false));
    }
    // Ones at the very end either are a sync mark or dangle behind the last
    // codeword. Dropped in both cases.

    fragments.retain(|fragment| !fragment.is_empty());
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn to_bit_stream_test() {
        let mut vout: Vec<u8> = Vec::new();

        let vin: Vec<u8> = vec![0xaa, 0x44, 0x89, 0x2a];
        for i in &vin {
            to_bit_stream(*i, |d| vout.push(u8::from(d.0)));
        }

        println!("{vout:?}");

        assert_eq!(
            vout,
            vec![
                1, 0, 1, 0, 1, 0, 1, 0, //aa
                0, 1, 0, 0, 0, 1, 0, 0, //44
                1, 0, 0, 0, 1, 0, 0, 1, //89
                0, 0, 1, 0, 1, 0, 1, 0, //2a
            ]
        );
    }

    #[test]
    fn bits_of_round_trip() {
        let bytes = vec![0x55, 0xff, 0x08, 0x00, 0xa7];
        assert_eq!(bytes_of(&bits_of(&bytes)), bytes);
    }

    #[test]
    fn bytes_of_pads_with_ones() {
        // 3 cells 010 -> 0101 1111
        let cells = vec![Bit(false), Bit(true), Bit(false)];
        assert_eq!(bytes_of(&cells), vec![0x5f]);
    }

    #[test]
    fn find_sync_mark_test() {
        // 0x01 0xff 0x80: the ten 1 bits start at bit 7
        let cells = bits_of(&[0x01, 0xff, 0x80]);
        assert_eq!(find_sync_mark(&cells), Some(7));

        // nine 1 bits are not a sync mark
        let cells = bits_of(&[0x01, 0xff, 0x00]);
        assert_eq!(find_sync_mark(&cells), None);
    }

    #[test]
    fn split_discards_sync_and_stray_ones() {
        // sync, fragment, long sync, fragment ending in stray ones
        let mut cells = Vec::new();
        for byte in [0xff, 0xff] {
            to_bit_stream(byte, |d| cells.push(d));
        }
        let first = [Bit(false), Bit(true), Bit(true), Bit(false)];
        cells.extend_from_slice(&first);
        for byte in [0xff, 0xff, 0xff] {
            to_bit_stream(byte, |d| cells.push(d));
        }
        let second = [Bit(false), Bit(false)];
        cells.extend_from_slice(&second);
        cells.push(Bit(true));

        let fragments = split_at_sync_marks(&cells);
        assert_eq!(fragments.len(), 2);
        assert_eq!(bytes_of(&fragments[0]), bytes_of(&first));
        assert_eq!(bytes_of(&fragments[1]), bytes_of(&second));
    }

    #[test]
    fn split_keeps_interior_ones() {
        // a run of nine 1 bits inside a fragment must survive
        let mut cells = vec![Bit(false)];
        for _ in 0..9 {
            cells.push(Bit(true));
        }
        cells.push(Bit(false));

        let fragments = split_at_sync_marks(&cells);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].len(), 11);
    }
}
