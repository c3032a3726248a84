use regex::bytes::Regex;

use crate::error::TransportError;

pub const BEACON_PREFIX: &str = "mega65ft1.";

const JOB_DONE_LEN: usize = "ftjobdone:0000:".len();
const JOB_DATA_LEN: usize = "ftjobdata:0000:00000000:".len();
const BATCH_DONE: &[u8] = b"ftbatchdone";
const BEACON_MAX: usize = 48;
// Longest header prefix minus one; kept across pushes so a split header is
// still found.
const TAIL_KEEP: usize = 10;
/// Upper bound on any `ftjobdata` size; the remote has 384 KiB of chip RAM.
pub const MAX_PAYLOAD: usize = 0x0006_0000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    JobDone { job: u16 },
    JobData { job: u16, data: Vec<u8> },
    BatchDone,
    Beacon { version: String },
}

enum Mode {
    Text,
    Data {
        job: u16,
        remaining: usize,
        data: Vec<u8>,
    },
}

/// Incremental decoder for the remote's serial stream. Monitor echo and other
/// chatter between notices is skipped.
pub struct NoticeDecoder {
    buf: Vec<u8>,
    mode: Mode,
    payload_limit: usize,
    header_re: Regex,
    done_re: Regex,
    data_re: Regex,
    beacon_re: Regex,
}

impl Default for NoticeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            mode: Mode::Text,
            payload_limit: MAX_PAYLOAD,
            header_re: Regex::new(r"ftjobdone:|ftjobdata:|ftbatchdone|mega65ft1\.")
                .expect("static regex"),
            done_re: Regex::new(r"^ftjobdone:([0-9a-fA-F]{4}):").expect("static regex"),
            data_re: Regex::new(r"^ftjobdata:([0-9a-fA-F]{4}):([0-9a-fA-F]{8}):")
                .expect("static regex"),
            beacon_re: Regex::new(r"^mega65ft1\.([0-9A-Za-z_.\-]*)[\r\n]").expect("static regex"),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True while raw `ftjobdata` payload bytes are still expected.
    pub fn in_data(&self) -> bool {
        matches!(self.mode, Mode::Data { .. })
    }

    /// Largest `ftjobdata` size accepted until the next call, capped at
    /// `MAX_PAYLOAD`.
    pub fn set_payload_limit(&mut self, limit: usize) {
        self.payload_limit = limit.min(MAX_PAYLOAD);
    }

    /// Forgets buffered bytes and any half-received payload.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.mode = Mode::Text;
    }

    pub fn next_notice(&mut self) -> Result<Option<Notice>, TransportError> {
        loop {
            if let Mode::Data {
                job,
                remaining,
                data,
            } = &mut self.mode
            {
                let take = (*remaining).min(self.buf.len());
                data.extend(self.buf.drain(..take));
                *remaining -= take;
                if *remaining > 0 {
                    return Ok(None);
                }
                let notice = Notice::JobData {
                    job: *job,
                    data: std::mem::take(data),
                };
                self.mode = Mode::Text;
                return Ok(Some(notice));
            }

            let Some(found) = self.header_re.find(&self.buf) else {
                let keep_from = self.buf.len().saturating_sub(TAIL_KEEP);
                self.buf.drain(..keep_from);
                return Ok(None);
            };
            self.buf.drain(..found.start());

            if self.buf.starts_with(b"ftjobdone:") {
                if self.buf.len() < JOB_DONE_LEN {
                    return Ok(None);
                }
                let job = self
                    .done_re
                    .captures(&self.buf)
                    .and_then(|c| c.get(1))
                    .and_then(|m| parse_hex_u16(m.as_bytes()));
                let Some(job) = job else {
                    return Err(self.reject(JOB_DONE_LEN, b"ftjobdone:".len()));
                };
                self.buf.drain(..JOB_DONE_LEN);
                return Ok(Some(Notice::JobDone { job }));
            }

            if self.buf.starts_with(b"ftjobdata:") {
                if self.buf.len() < JOB_DATA_LEN {
                    return Ok(None);
                }
                let header = self.data_re.captures(&self.buf).and_then(|c| {
                    let job = parse_hex_u16(c.get(1)?.as_bytes())?;
                    let size = parse_hex_u32(c.get(2)?.as_bytes())?;
                    Some((job, size as usize))
                });
                let Some((job, size)) = header else {
                    return Err(self.reject(JOB_DATA_LEN, b"ftjobdata:".len()));
                };
                if size > self.payload_limit {
                    return Err(self.reject(JOB_DATA_LEN, JOB_DATA_LEN));
                }
                self.buf.drain(..JOB_DATA_LEN);
                self.mode = Mode::Data {
                    job,
                    remaining: size,
                    data: Vec::with_capacity(size),
                };
                continue;
            }

            if self.buf.starts_with(BATCH_DONE) {
                self.buf.drain(..BATCH_DONE.len());
                return Ok(Some(Notice::BatchDone));
            }

            // Beacon: wait for its line terminator.
            let terminated = self
                .buf
                .iter()
                .take(BEACON_MAX)
                .any(|b| *b == b'\n' || *b == b'\r');
            if !terminated {
                if self.buf.len() < BEACON_MAX {
                    return Ok(None);
                }
                return Err(self.reject(BEACON_MAX, BEACON_PREFIX.len()));
            }
            let beacon = self.beacon_re.captures(&self.buf).map(|caps| {
                let consumed = caps.get(0).map_or(0, |m| m.end());
                let version = caps
                    .get(1)
                    .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
                    .unwrap_or_default();
                (version, consumed)
            });
            let Some((version, consumed)) = beacon else {
                return Err(self.reject(BEACON_MAX, BEACON_PREFIX.len()));
            };
            self.buf.drain(..consumed);
            return Ok(Some(Notice::Beacon { version }));
        }
    }

    /// Reports the first `shown` bytes and drops `skip` of them so the next
    /// call scans past the bad header.
    fn reject(&mut self, shown: usize, skip: usize) -> TransportError {
        let end = shown.min(self.buf.len());
        let err = TransportError::MalformedNotice(
            String::from_utf8_lossy(&self.buf[..end])
                .trim_end()
                .to_string(),
        );
        self.buf.drain(..skip.min(self.buf.len()));
        err
    }
}

fn parse_hex_u16(raw: &[u8]) -> Option<u16> {
    u16::from_str_radix(std::str::from_utf8(raw).ok()?, 16).ok()
}

fn parse_hex_u32(raw: &[u8]) -> Option<u32> {
    u32::from_str_radix(std::str::from_utf8(raw).ok()?, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut NoticeDecoder) -> Vec<Notice> {
        let mut out = Vec::new();
        while let Some(notice) = decoder.next_notice().expect("well-formed stream") {
            out.push(notice);
        }
        out
    }

    #[test]
    fn decodes_done_data_and_batch_end() {
        let mut decoder = NoticeDecoder::new();
        decoder.push(b"ftjobdone:c001:\n\rftjobdata:c00a:00000003:");
        decoder.push(&[0x00, b'f', 0xFF]);
        decoder.push(b"ftjobdone:c00a:\n\rftbatchdone\n");
        assert_eq!(
            drain(&mut decoder),
            vec![
                Notice::JobDone { job: 0xC001 },
                Notice::JobData {
                    job: 0xC00A,
                    data: vec![0x00, b'f', 0xFF],
                },
                Notice::JobDone { job: 0xC00A },
                Notice::BatchDone,
            ]
        );
    }

    #[test]
    fn payload_bytes_that_look_like_notices_are_data() {
        let mut decoder = NoticeDecoder::new();
        decoder.push(b"ftjobdata:c001:0000000b:ftbatchdone");
        assert_eq!(
            drain(&mut decoder),
            vec![Notice::JobData {
                job: 0xC001,
                data: b"ftbatchdone".to_vec(),
            }]
        );
    }

    #[test]
    fn beacon_is_separated_from_job_notices() {
        let mut decoder = NoticeDecoder::new();
        decoder.push(b"\nmega65ft1.0\n\rftjobdone:c001:\n\r");
        assert_eq!(
            drain(&mut decoder),
            vec![
                Notice::Beacon {
                    version: "0".to_string()
                },
                Notice::JobDone { job: 0xC001 },
            ]
        );
    }

    #[test]
    fn headers_split_across_reads_are_reassembled() {
        let stream = b".sc000 2\r\nftjobdone:c001:\n\rftbatchdone\n";
        let mut decoder = NoticeDecoder::new();
        let mut seen = Vec::new();
        for chunk in stream.chunks(3) {
            decoder.push(chunk);
            seen.extend(drain(&mut decoder));
        }
        assert_eq!(
            seen,
            vec![Notice::JobDone { job: 0xC001 }, Notice::BatchDone]
        );
    }

    #[test]
    fn monitor_noise_is_skipped() {
        let mut decoder = NoticeDecoder::new();
        decoder.push(b"sc001 01 00 00 04 00\r\n.\r\n");
        assert!(drain(&mut decoder).is_empty());
        decoder.push(b"ftbatchdone");
        assert_eq!(drain(&mut decoder), vec![Notice::BatchDone]);
    }

    #[test]
    fn bad_hex_in_job_done_is_malformed() {
        let mut decoder = NoticeDecoder::new();
        decoder.push(b"ftjobdone:zz01:\n");
        assert!(matches!(
            decoder.next_notice(),
            Err(TransportError::MalformedNotice(_))
        ));
    }

    #[test]
    fn decoding_resumes_after_a_malformed_header() {
        let mut decoder = NoticeDecoder::new();
        decoder.push(b"ftjobdone:zz01:\n\rftjobdone:c001:\n\rftbatchdone\n");
        assert!(decoder.next_notice().is_err());
        assert_eq!(
            drain(&mut decoder),
            vec![Notice::JobDone { job: 0xC001 }, Notice::BatchDone]
        );
    }

    #[test]
    fn oversized_data_header_is_refused() {
        let mut decoder = NoticeDecoder::new();
        decoder.push(b"ftjobdata:c001:ffffffff:ftbatchdone\n");
        assert!(matches!(
            decoder.next_notice(),
            Err(TransportError::MalformedNotice(_))
        ));
        assert!(!decoder.in_data());
        assert_eq!(drain(&mut decoder), vec![Notice::BatchDone]);

        decoder.set_payload_limit(512);
        decoder.push(b"ftjobdata:c001:00000201:");
        assert!(decoder.next_notice().is_err());
        decoder.push(b"ftjobdata:c001:00000002:ok");
        assert_eq!(
            drain(&mut decoder),
            vec![Notice::JobData {
                job: 0xC001,
                data: b"ok".to_vec(),
            }]
        );
    }

    #[test]
    fn reset_abandons_a_truncated_payload() {
        let mut decoder = NoticeDecoder::new();
        decoder.push(b"ftjobdata:c001:00004000:\x01\x02");
        assert_eq!(decoder.next_notice().unwrap(), None);
        assert!(decoder.in_data());

        decoder.reset();
        assert!(!decoder.in_data());
        decoder.push(b"ftbatchdone\n");
        assert_eq!(drain(&mut decoder), vec![Notice::BatchDone]);
    }

    #[test]
    fn unterminated_beacon_is_malformed_once_too_long() {
        let mut decoder = NoticeDecoder::new();
        decoder.push(b"mega65ft1.");
        assert_eq!(decoder.next_notice().unwrap(), None);
        decoder.push(&[b'9'; 60]);
        assert!(matches!(
            decoder.next_notice(),
            Err(TransportError::MalformedNotice(_))
        ));
    }
}
