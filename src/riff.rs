//! There's an abomination called RMID, MIDI embedded in a RIFF file.
//! Support for these files is provided by unwrapping the input slice, stripping away the RIFF
//! wrappers around the raw SMF file.

use crate::prelude::*;

struct ChunkIter<'a>(ByteCursor<'a>);
impl<'a> Iterator for ChunkIter<'a> {
    type Item = ([u8; 4], &'a [u8]);
    fn next(&mut self) -> Option<([u8; 4], &'a [u8])> {
        if self.0.remaining() < 8 {
            return None;
        }
        let mut id = [0; 4];
        id.copy_from_slice(self.0.read_bytes(4).ok()?);
        let mut len = [0; 4];
        len.copy_from_slice(self.0.read_bytes(4).ok()?);
        let len = u32::from_le_bytes(len) as usize;
        //Accept a data chunk cut short by the end of the file
        let data = match self.0.read_bytes(len) {
            Ok(data) => data,
            Err(_) => {
                let rest = self.0.unread();
                self.0 = ByteCursor::new(&[]);
                rest
            }
        };
        if len % 2 == 1 {
            let _pad = self.0.skip(1);
        }
        Some((id, data))
    }
}

/// Whether `raw` starts like a RIFF container.
pub(crate) fn is_riff(raw: &[u8]) -> bool {
    raw.starts_with(b"RIFF")
}

/// Extract the SMF bytes held in the `data` chunk of an RMID file.
pub(crate) fn unwrap(raw: &[u8]) -> Result<&[u8]> {
    let (id, riff) = ChunkIter(ByteCursor::new(raw))
        .next()
        .ok_or(err_truncated!("no main riff chunk"))?;
    ensure!(&id == b"RIFF", err_format!("invalid main riff chunk"));
    let mut riff = ByteCursor::new(riff);
    let formtype = riff.read_bytes(4).context("failed to read riff formtype")?;
    ensure!(formtype == b"RMID", err_unsupported!("not an rmid riff file"));
    for (id, chunk) in ChunkIter(riff) {
        if &id == b"data" {
            return Ok(chunk);
        }
    }
    bail!(err_format!("no rmid data chunk"))
}
