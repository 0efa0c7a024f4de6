//! Wire protocol: frame header, command tags and payload codecs.
//!
//! Every frame starts with an 8-byte header, a 32-bit magic followed by a
//! 32-bit command tag, little-endian like every other integer on the wire.
//! Path and symbol fields are fixed 1024-byte NUL-padded buffers; EXEC
//! strings are length-prefixed with no terminator on the wire and get their
//! NUL appended on this side.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_enum::TryFromPrimitive;
use std::ffi::CString;
use std::io::{Read, Write};
use thiserror::Error;

/// Magic carried by every frame header, both directions.
pub const MAGIC: u32 = 0x1234_5678;
/// First word of the handshake; version nibble in the low byte.
pub const SERVER_MAGIC_VERSION: u32 = 0x8888_8800;
/// Sentinel PID reported when a spawn fails. Never a real child PID.
pub const INVALID_PID: u32 = 0xffff_ffff;
/// Fixed on-wire width of DLOPEN path and DLSYM symbol fields.
pub const PATH_LEN: usize = 1024;
/// Fixed on-wire width of the OS-name field in the handshake.
pub const OS_NAME_LEN: usize = 256;
/// CALL dispatches at most this many argument words.
pub const MAX_CALL_ARGS: u64 = 11;

/// Exec chunk tag: child terminal output.
pub const CHUNK_STDOUT: u32 = 0;
/// Exec chunk tag: final wait status, ends the stream.
pub const CHUNK_EXITCODE: u32 = 1;

/// Command tags. REPLY_* are only ever produced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum CmdType {
    Exec = 0,
    Dlopen = 1,
    Dlclose = 2,
    Dlsym = 3,
    Call = 4,
    Peek = 5,
    Poke = 6,
    ReplyError = 7,
    ReplyPeek = 8,
    GetDummyBlock = 9,
    Close = 10,
    ReplyPoke = 11,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad frame magic {0:#010x}")]
    BadMagic(u32),
    #[error("unknown command tag {0}")]
    UnknownCommand(u32),
    #[error("string field contains an interior NUL")]
    BadString(#[from] std::ffi::NulError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Parse the 8-byte frame header. A magic mismatch or an unknown tag is
/// fatal to the stream: nothing that follows a bad header can be trusted.
pub fn parse_header(buf: &[u8; 8]) -> Result<CmdType> {
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let tag = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    CmdType::try_from(tag).map_err(|_| ProtocolError::UnknownCommand(tag))
}

/// Write a frame header for a server-emitted reply.
pub fn write_header<W: Write>(w: &mut W, cmd: CmdType) -> std::io::Result<()> {
    w.write_u32::<LittleEndian>(MAGIC)?;
    w.write_u32::<LittleEndian>(cmd as u32)
}

/// Parsed EXEC request, argv/envp ready for the exec family.
/// An empty `envp` means "inherit the server's environment".
#[derive(Debug)]
pub struct ExecRequest {
    pub background: bool,
    pub argv: Vec<CString>,
    pub envp: Vec<CString>,
}

pub fn read_exec_request<R: Read>(r: &mut R) -> Result<ExecRequest> {
    let background = r.read_u8()? != 0;
    let argc = r.read_u32::<LittleEndian>()?;
    let argv = read_string_vec(r, argc)?;
    let envc = r.read_u32::<LittleEndian>()?;
    let envp = read_string_vec(r, envc)?;
    Ok(ExecRequest {
        background,
        argv,
        envp,
    })
}

fn read_string_vec<R: Read>(r: &mut R, count: u32) -> Result<Vec<CString>> {
    let mut out = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let len = r.read_u32::<LittleEndian>()? as usize;
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf)?;
        out.push(CString::new(buf)?);
    }
    Ok(out)
}

/// Stream one STDOUT exec chunk carrying exactly `data`.
pub fn write_stdout_chunk<W: Write>(w: &mut W, data: &[u8]) -> std::io::Result<()> {
    w.write_u32::<LittleEndian>(CHUNK_STDOUT)?;
    w.write_u32::<LittleEndian>(data.len() as u32)?;
    w.write_all(data)
}

/// Stream the final EXITCODE chunk with the raw wait status word.
pub fn write_exit_chunk<W: Write>(w: &mut W, status: i32) -> std::io::Result<()> {
    w.write_u32::<LittleEndian>(CHUNK_EXITCODE)?;
    w.write_u32::<LittleEndian>(std::mem::size_of::<i32>() as u32)?;
    w.write_i32::<LittleEndian>(status)
}

/// Read a fixed-width NUL-padded string field, keeping the bytes up to the
/// first NUL.
pub fn read_fixed_cstring<R: Read>(r: &mut R, width: usize) -> Result<CString> {
    let mut buf = vec![0u8; width];
    r.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(width);
    buf.truncate(end);
    Ok(CString::new(buf)?)
}

#[derive(Debug)]
pub struct DlopenRequest {
    pub filename: CString,
    pub mode: u32,
}

pub fn read_dlopen_request<R: Read>(r: &mut R) -> Result<DlopenRequest> {
    let filename = read_fixed_cstring(r, PATH_LEN)?;
    let mode = r.read_u32::<LittleEndian>()?;
    Ok(DlopenRequest { filename, mode })
}

#[derive(Debug)]
pub struct DlsymRequest {
    pub lib: u64,
    pub symbol: CString,
}

pub fn read_dlsym_request<R: Read>(r: &mut R) -> Result<DlsymRequest> {
    let lib = r.read_u64::<LittleEndian>()?;
    let symbol = read_fixed_cstring(r, PATH_LEN)?;
    Ok(DlsymRequest { lib, symbol })
}

/// CALL request. Argument words beyond [`MAX_CALL_ARGS`] are consumed from
/// the stream and dropped so it stays aligned; the gadget then performs no
/// call. `argc` keeps the announced count so the handler can tell.
#[derive(Debug)]
pub struct CallRequest {
    pub address: u64,
    pub argc: u64,
    pub args: Vec<u64>,
}

pub fn read_call_request<R: Read>(r: &mut R) -> Result<CallRequest> {
    let address = r.read_u64::<LittleEndian>()?;
    let argc = r.read_u64::<LittleEndian>()?;
    let keep = argc.min(MAX_CALL_ARGS) as usize;
    let mut args = Vec::with_capacity(keep);
    for _ in 0..keep {
        args.push(r.read_u64::<LittleEndian>()?);
    }
    for _ in keep as u64..argc {
        let _ = r.read_u64::<LittleEndian>()?;
    }
    Ok(CallRequest {
        address,
        argc,
        args,
    })
}

/// Shared shape of PEEK and POKE requests: an address and a byte count.
/// For POKE the data bytes follow on the wire.
#[derive(Debug, Clone, Copy)]
pub struct RangeRequest {
    pub address: u64,
    pub size: u64,
}

pub fn read_range_request<R: Read>(r: &mut R) -> Result<RangeRequest> {
    let address = r.read_u64::<LittleEndian>()?;
    let size = r.read_u64::<LittleEndian>()?;
    Ok(RangeRequest { address, size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header_bytes(magic: u32, tag: u32) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&magic.to_le_bytes());
        buf[4..].copy_from_slice(&tag.to_le_bytes());
        buf
    }

    #[test]
    fn header_round_trip() {
        let mut out = Vec::new();
        write_header(&mut out, CmdType::ReplyPeek).unwrap();
        let buf: [u8; 8] = out.try_into().unwrap();
        assert_eq!(parse_header(&buf).unwrap(), CmdType::ReplyPeek);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = header_bytes(0xdead_beef, 0);
        match parse_header(&buf) {
            Err(ProtocolError::BadMagic(m)) => assert_eq!(m, 0xdead_beef),
            other => panic!("expected BadMagic, got {:?}", other),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let buf = header_bytes(MAGIC, 99);
        match parse_header(&buf) {
            Err(ProtocolError::UnknownCommand(t)) => assert_eq!(t, 99),
            other => panic!("expected UnknownCommand, got {:?}", other),
        }
    }

    #[test]
    fn exec_request_parses_argv_and_envp() {
        let mut wire = Vec::new();
        wire.push(0u8); // interactive
        wire.extend_from_slice(&2u32.to_le_bytes());
        for arg in [&b"/bin/cat"[..], &b"-"[..]] {
            wire.extend_from_slice(&(arg.len() as u32).to_le_bytes());
            wire.extend_from_slice(arg);
        }
        wire.extend_from_slice(&1u32.to_le_bytes());
        wire.extend_from_slice(&4u32.to_le_bytes());
        wire.extend_from_slice(b"A=se");

        let req = read_exec_request(&mut Cursor::new(wire)).unwrap();
        assert!(!req.background);
        assert_eq!(req.argv.len(), 2);
        assert_eq!(req.argv[0].to_bytes(), b"/bin/cat");
        assert_eq!(req.argv[1].to_bytes(), b"-");
        assert_eq!(req.envp.len(), 1);
        assert_eq!(req.envp[0].to_bytes(), b"A=se");
    }

    #[test]
    fn exec_request_empty_env_means_inherit() {
        let mut wire = Vec::new();
        wire.push(1u8);
        wire.extend_from_slice(&1u32.to_le_bytes());
        wire.extend_from_slice(&7u32.to_le_bytes());
        wire.extend_from_slice(b"/bin/ls");
        wire.extend_from_slice(&0u32.to_le_bytes());

        let req = read_exec_request(&mut Cursor::new(wire)).unwrap();
        assert!(req.background);
        assert!(req.envp.is_empty());
    }

    #[test]
    fn fixed_cstring_stops_at_first_nul() {
        let mut wire = vec![0u8; PATH_LEN];
        wire[..9].copy_from_slice(b"/lib/x.so");
        let s = read_fixed_cstring(&mut Cursor::new(wire), PATH_LEN).unwrap();
        assert_eq!(s.to_bytes(), b"/lib/x.so");
    }

    #[test]
    fn fixed_cstring_full_width_without_nul() {
        let wire = vec![b'a'; PATH_LEN];
        let s = read_fixed_cstring(&mut Cursor::new(wire), PATH_LEN).unwrap();
        assert_eq!(s.to_bytes().len(), PATH_LEN);
    }

    #[test]
    fn call_request_keeps_up_to_eleven_args() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&0x1000u64.to_le_bytes());
        wire.extend_from_slice(&11u64.to_le_bytes());
        for i in 0..11u64 {
            wire.extend_from_slice(&i.to_le_bytes());
        }
        let req = read_call_request(&mut Cursor::new(wire)).unwrap();
        assert_eq!(req.argc, 11);
        assert_eq!(req.args.len(), 11);
        assert_eq!(req.args[10], 10);
    }

    #[test]
    fn call_request_drains_excess_args() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&0x1000u64.to_le_bytes());
        wire.extend_from_slice(&13u64.to_le_bytes());
        for i in 0..13u64 {
            wire.extend_from_slice(&i.to_le_bytes());
        }
        // trailing marker proves the excess words were consumed, not left over
        wire.extend_from_slice(&0xabcdu32.to_le_bytes());

        let mut cursor = Cursor::new(wire);
        let req = read_call_request(&mut cursor).unwrap();
        assert_eq!(req.argc, 13);
        assert_eq!(req.args.len(), 11);
        use byteorder::{LittleEndian, ReadBytesExt};
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 0xabcd);
    }

    #[test]
    fn stdout_chunk_layout() {
        let mut out = Vec::new();
        write_stdout_chunk(&mut out, b"hi").unwrap();
        assert_eq!(&out[..4], &CHUNK_STDOUT.to_le_bytes());
        assert_eq!(&out[4..8], &2u32.to_le_bytes());
        assert_eq!(&out[8..], b"hi");
    }

    #[test]
    fn exit_chunk_carries_raw_status() {
        let mut out = Vec::new();
        write_exit_chunk(&mut out, 0x0f00).unwrap();
        assert_eq!(&out[..4], &CHUNK_EXITCODE.to_le_bytes());
        assert_eq!(&out[4..8], &4u32.to_le_bytes());
        assert_eq!(&out[8..], &0x0f00i32.to_le_bytes());
    }
}
