//! Dynamic-loader marshaling: DLOPEN, DLCLOSE and DLSYM.
//!
//! Handles and symbol addresses travel as opaque u64 values; whatever the
//! loader returns goes back verbatim, including its null-on-failure and
//! nonzero-on-failure conventions. These commands never produce a
//! REPLY_ERROR frame.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::net::TcpStream;
use tracing::debug;

use crate::protocol;

pub fn handle_dlopen(stream: &mut TcpStream) -> anyhow::Result<()> {
    let req = protocol::read_dlopen_request(stream)?;
    let handle = if req.filename.is_empty() {
        // empty path means the program's own handle
        unsafe { libc::dlopen(std::ptr::null(), req.mode as libc::c_int) }
    } else {
        unsafe { libc::dlopen(req.filename.as_ptr(), req.mode as libc::c_int) }
    };
    debug!(filename = ?req.filename, mode = req.mode, handle = handle as u64, "dlopen");
    stream.write_u64::<LittleEndian>(handle as u64)?;
    Ok(())
}

pub fn handle_dlclose(stream: &mut TcpStream) -> anyhow::Result<()> {
    let lib = stream.read_u64::<LittleEndian>()?;
    // the loader faults on a null handle; report failure instead
    let rc: libc::c_int = if lib == 0 {
        -1
    } else {
        unsafe { libc::dlclose(lib as *mut libc::c_void) }
    };
    debug!(lib, rc, "dlclose");
    stream.write_u64::<LittleEndian>(rc as i64 as u64)?;
    Ok(())
}

pub fn handle_dlsym(stream: &mut TcpStream) -> anyhow::Result<()> {
    let req = protocol::read_dlsym_request(stream)?;
    let addr =
        unsafe { libc::dlsym(req.lib as *mut libc::c_void, req.symbol.as_ptr()) };
    debug!(symbol = ?req.symbol, addr = addr as u64, "dlsym");
    stream.write_u64::<LittleEndian>(addr as u64)?;
    Ok(())
}
