// Reverse-proxy control protocol: a fixed 4-byte frame `[cmd, n, 0xEE, 0xFF]`
// exchanged over the same TCP connection used for the rendezvous handshake.

use std::io::{self, Read, Write};

use crate::error::NetworkError;

pub const FRAME_LEN: usize = 4;
pub const FRAME_TAIL: [u8; 2] = [0xEE, 0xFF];

pub const CMD_HANDSHAKE: u8 = 0;
pub const CMD_CONNECT_ME: u8 = 1;
pub const CMD_CLEANUP: u8 = 2;

pub const CLIENT_HANDSHAKE: u8 = 0xC0;
pub const SERVER_HANDSHAKE: u8 = 0xE0;

/// Maximum outstanding `CONNECT_ME` workers the rendezvous side will queue
/// local connections for.
pub const MAX_CONNECTION: usize = 0x800;

#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub cmd: u8,
    pub n: u8,
}

impl Frame {
    pub fn marshal(self) -> [u8; FRAME_LEN] {
        [self.cmd, self.n, FRAME_TAIL[0], FRAME_TAIL[1]]
    }
}

pub fn write_frame(w: &mut impl Write, frame: Frame) -> io::Result<()> {
    w.write_all(&frame.marshal())
}

/// Reads exactly 4 bytes and checks the trailing sentinel. A mismatched
/// sentinel is a fatal framing error for this connection rather than an
/// invitation to keep scanning — the protocol has no way to resynchronize
/// mid-stream.
pub fn read_frame(r: &mut impl Read) -> Result<Frame, NetworkError> {
    let mut output = Vec::with_capacity(FRAME_LEN);
    let mut byte = [0u8; 1];
    loop {
        if output.len() > FRAME_LEN {
            return Err(NetworkError::Framing);
        }
        r.read_exact(&mut byte)?;
        output.push(byte[0]);
        if output.len() == FRAME_LEN && output[2] == FRAME_TAIL[0] && output[3] == FRAME_TAIL[1] {
            return Ok(Frame {
                cmd: output[0],
                n: output[1],
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn marshal_unmarshal_round_trip() {
        let frame = Frame {
            cmd: CMD_CONNECT_ME,
            n: 3,
        };
        let bytes = frame.marshal();
        assert_eq!(bytes, [1, 3, 0xEE, 0xFF]);
        let mut cursor = Cursor::new(bytes.to_vec());
        let parsed = read_frame(&mut cursor).unwrap();
        assert_eq!(parsed.cmd, CMD_CONNECT_ME);
        assert_eq!(parsed.n, 3);
    }

    #[test]
    fn bad_sentinel_is_framing_error() {
        let bytes = [0u8, 1, 0xAA, 0xBB];
        let mut cursor = Cursor::new(bytes.to_vec());
        let err = read_frame(&mut cursor);
        assert!(matches!(err, Err(NetworkError::Framing)));
    }

    #[test]
    fn handshake_constants_round_trip() {
        let frame = Frame {
            cmd: CMD_HANDSHAKE,
            n: CLIENT_HANDSHAKE,
        };
        let mut cursor = Cursor::new(frame.marshal().to_vec());
        let parsed = read_frame(&mut cursor).unwrap();
        assert_eq!(parsed.cmd, CMD_HANDSHAKE);
        assert_eq!(parsed.n, CLIENT_HANDSHAKE);
    }
}
