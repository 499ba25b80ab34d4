//! Sequential log replay with transactional framing.
//!
//! Replay walks a log file record by record and hands committed data to a
//! callback. Records flagged `TXN` are staged until their group's
//! `FIN_TXN` sentinel arrives; a group whose sentinel never made it to
//! disk is invisible — its records sit between the returned watermark and
//! the stop point, to be truncated or overwritten by the caller.
//!
//! Stop conditions fall into two classes:
//!
//! - **soft** — zero header, truncated record, checksum mismatch, or a torn
//!   / interleaved transaction group. The crashed writer's trailing bytes
//!   are *expected* to look like this; replay simply stops and reports the
//!   last offset it could vouch for.
//! - **fatal** — cipher failures and other decode errors that cannot be
//!   explained by a torn tail. These propagate with file context.

use std::ops::ControlFlow;
use std::slice;
use std::sync::PoisonError;

use tracing::{trace, warn};

use crate::codec::{self, CodecError};
use crate::entry::{BIT_FIN_TXN, BIT_TXN, Entry, ValuePointer, parse_ts};
use crate::wal::{LOG_HEADER_SIZE, LogFile, WalError};

/// Callback invoked for every committed entry during replay.
///
/// Returning `ControlFlow::Break(())` stops iteration early — a sentinel,
/// not an error. Errors propagate to the caller of
/// [`LogFile::iterate`].
pub type ReplayFn<'a> =
    dyn FnMut(Entry, ValuePointer) -> Result<ControlFlow<()>, WalError> + 'a;

impl LogFile {
    /// Walks the log from `start_offset` (`0` means "just past the file
    /// header"), feeding committed entries to `f` in log order, and
    /// returns the **valid end offset**: the byte just past the last
    /// record replay could vouch for.
    ///
    /// Holds the shared lock for the whole walk, so rotation and deletion
    /// wait for replay to finish.
    pub fn iterate(&self, start_offset: u32, f: &mut ReplayFn<'_>) -> Result<u32, WalError> {
        let mut offset = if start_offset == 0 {
            LOG_HEADER_SIZE
        } else {
            start_offset
        };

        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let map = guard.map()?;
        // SAFETY: the shared guard pins the mapping for the lifetime of
        // `data`; replay only reads, and the single appender (if any)
        // writes strictly past the offsets visited here.
        let data = unsafe { slice::from_raw_parts(map.as_ptr(), map.len()) };

        // Watermark of consistent, committed data.
        let mut valid_end = offset;
        // Commit timestamp of the transaction group being staged; 0 = none.
        let mut last_commit: u64 = 0;
        let mut staged: Vec<(Entry, ValuePointer)> = Vec::new();

        'walk: while (offset as usize) < data.len() {
            let (entry, consumed) =
                match codec::decode_entry(&data[offset as usize..], offset, self.cipher()) {
                    Ok(decoded) => decoded,
                    Err(CodecError::ZeroHeader) => {
                        trace!(fid = self.fid(), offset, "zero header; end of log data");
                        break;
                    }
                    Err(CodecError::Truncate) => {
                        warn!(fid = self.fid(), offset, "truncated record; stopping replay");
                        break;
                    }
                    Err(CodecError::ChecksumMismatch { expected, actual }) => {
                        warn!(
                            fid = self.fid(),
                            offset, expected, actual, "checksum mismatch; treating as end of valid data"
                        );
                        break;
                    }
                    Err(e) => return Err(self.codec_err(e)),
                };

            let end = offset + consumed as u32;
            let vp = ValuePointer {
                fid: self.fid(),
                offset,
                len: consumed as u32,
            };

            if entry.meta & BIT_TXN != 0 {
                let txn_ts = parse_ts(&entry.key);
                if last_commit == 0 {
                    last_commit = txn_ts;
                }
                if last_commit != txn_ts {
                    warn!(
                        fid = self.fid(),
                        offset, last_commit, txn_ts, "transaction timestamp changed mid-group; torn group"
                    );
                    break;
                }
                staged.push((entry, vp));
            } else if entry.meta & BIT_FIN_TXN != 0 {
                // The sentinel's value is the ASCII decimal commit timestamp.
                let sentinel_ts = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok());
                match sentinel_ts {
                    Some(ts) if ts == last_commit => {}
                    _ => {
                        warn!(
                            fid = self.fid(),
                            offset, last_commit, "sentinel does not close the staged group; torn group"
                        );
                        break;
                    }
                }

                // The group is committed: it becomes visible as a unit.
                last_commit = 0;
                valid_end = end;
                for (staged_entry, staged_vp) in staged.drain(..) {
                    if f(staged_entry, staged_vp)?.is_break() {
                        break 'walk;
                    }
                }
            } else {
                if last_commit != 0 {
                    // A plain record inside a transaction group. Most
                    // likely a relocated record overwrote part of the
                    // group; nothing after this point can be trusted.
                    warn!(
                        fid = self.fid(),
                        offset, last_commit, "non-transactional record inside a group; stopping replay"
                    );
                    break;
                }
                valid_end = end;
                if f(entry, vp)?.is_break() {
                    break;
                }
            }

            offset = end;
        }

        Ok(valid_end)
    }
}
