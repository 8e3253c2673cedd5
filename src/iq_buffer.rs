use crate::radio::Sample;
use failure::{bail, Error};
use std::io::{Read, Write};

/// Complex samples indexed by (channel, sample). During a capture the receive task is the only
/// writer; afterwards the buffer is moved to whoever persists or analyzes it.
#[derive(Clone, Debug, PartialEq)]
pub struct IqBuffer {
    rows: Vec<Vec<Sample>>,
    capacity: usize,
}

impl IqBuffer {
    /// Allocates `capacity` samples for each of `num_channels` channels up front
    pub fn with_capacity(num_channels: usize, capacity: usize) -> Self {
        Self {
            rows: (0..num_channels).map(|_| Vec::with_capacity(capacity)).collect(),
            capacity,
        }
    }

    /// Wraps already-captured rows. All rows must have the same length
    pub fn from_rows(rows: Vec<Vec<Sample>>) -> Result<Self, Error> {
        let len = rows.first().map_or(0, |r| r.len());
        if rows.iter().any(|r| r.len() != len) {
            bail!("all channels of an IQ buffer must have the same length");
        }
        Ok(Self {
            rows,
            capacity: len,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.first().map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channel(&self, idx: usize) -> &[Sample] {
        &self.rows[idx]
    }

    pub fn rows(&self) -> &[Vec<Sample>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Sample>> {
        self.rows
    }

    /// Appends the first `n` samples of every channel in `block`, but only if the whole block
    /// fits. Returns `false` (and leaves the buffer untouched) otherwise, so a capture never
    /// runs past its allocation and never keeps half a block. A block with the wrong number of
    /// channels, or a channel shorter than `n`, is refused the same way.
    pub fn push_block(&mut self, block: &[Vec<Sample>], n: usize) -> bool {
        if n == 0 || self.len() + n > self.capacity {
            return false;
        }
        if block.len() != self.rows.len() || block.iter().any(|b| b.len() < n) {
            return false;
        }
        for (row, samps) in self.rows.iter_mut().zip(block) {
            row.extend_from_slice(&samps[..n]);
        }
        true
    }

    /// Drops the first `n` samples of every channel (all of them if fewer are present)
    pub fn trim_front(&mut self, n: usize) {
        for row in &mut self.rows {
            let n = n.min(row.len());
            row.drain(..n);
        }
    }

    /// Little-endian f32 pairs (I then Q), one channel after the other
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<(), Error> {
        for row in &self.rows {
            let mut bytes = Vec::with_capacity(row.len() * 8);
            for s in row {
                bytes.extend_from_slice(&s.re.to_le_bytes());
                bytes.extend_from_slice(&s.im.to_le_bytes());
            }
            w.write_all(&bytes)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Reads what `write_to` produced. The channel count is not stored in the file, it comes from
    /// the capture's metadata.
    pub fn read_from<R: Read>(mut r: R, num_channels: usize) -> Result<Self, Error> {
        if num_channels == 0 {
            bail!("an IQ file needs at least one channel");
        }
        let mut bytes = Vec::new();
        r.read_to_end(&mut bytes)?;
        let row_bytes = bytes.len() / num_channels;
        if bytes.len() % (num_channels * 8) != 0 {
            bail!(
                "IQ file of {} bytes does not hold {} whole channels",
                bytes.len(),
                num_channels
            );
        }
        let rows = bytes
            .chunks_exact(row_bytes.max(1))
            .take(num_channels)
            .map(|row| {
                row.chunks_exact(8)
                    .map(|c| {
                        Sample::new(
                            f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                            f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                        )
                    })
                    .collect()
            })
            .collect::<Vec<Vec<Sample>>>();
        if rows.len() < num_channels {
            // Empty file
            return Ok(Self::with_capacity(num_channels, 0));
        }
        Self::from_rows(rows)
    }
}
