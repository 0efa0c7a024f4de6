//! PEEK and POKE: raw access to this process's address space.
//!
//! On Linux every transfer goes through the kernel-assisted probe
//! (`process_vm_readv`/`process_vm_writev` aimed at our own task), so a bad
//! address comes back as REPLY_ERROR instead of faulting halfway through a
//! reply. On other unix there is no probe: the copy is direct and a bad
//! address takes the process down.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Read;
use std::net::TcpStream;
use tracing::warn;

use crate::protocol::{self, CmdType};
use crate::transport;

/// Transfers above this many bytes are refused with REPLY_ERROR.
pub const MAX_TRANSFER: u64 = 64 * 1024 * 1024;

pub fn handle_peek(stream: &mut TcpStream) -> anyhow::Result<()> {
    let req = protocol::read_range_request(stream)?;
    if req.size > MAX_TRANSFER {
        warn!(size = req.size, "peek over transfer cap");
        protocol::write_header(stream, CmdType::ReplyError)?;
        return Ok(());
    }
    match read_process_memory(req.address, req.size as usize) {
        Some(data) => {
            protocol::write_header(stream, CmdType::ReplyPeek)?;
            transport::send_all(stream, &data)?;
        }
        None => {
            warn!(address = req.address, size = req.size, "peek probe failed");
            protocol::write_header(stream, CmdType::ReplyError)?;
        }
    }
    Ok(())
}

pub fn handle_poke(stream: &mut TcpStream) -> anyhow::Result<()> {
    let req = protocol::read_range_request(stream)?;
    if req.size > MAX_TRANSFER {
        warn!(size = req.size, "poke over transfer cap");
        // the announced bytes still have to leave the stream
        drain(stream, req.size)?;
        protocol::write_header(stream, CmdType::ReplyError)?;
        return Ok(());
    }
    let mut data = vec![0u8; req.size as usize];
    transport::recv_all(stream, &mut data)?;
    if write_process_memory(req.address, &data) {
        protocol::write_header(stream, CmdType::ReplyPoke)?;
    } else {
        warn!(address = req.address, size = req.size, "poke probe failed");
        protocol::write_header(stream, CmdType::ReplyError)?;
    }
    Ok(())
}

/// Well-known process-resident address for clients that resolve closure
/// descriptors at runtime. The concept does not apply here, so the address
/// is zero.
pub fn handle_get_dummy_block(stream: &mut TcpStream) -> anyhow::Result<()> {
    stream.write_u64::<LittleEndian>(0)?;
    Ok(())
}

fn drain(stream: &mut TcpStream, size: u64) -> anyhow::Result<()> {
    let copied = std::io::copy(&mut stream.by_ref().take(size), &mut std::io::sink())?;
    anyhow::ensure!(copied == size, "stream ended while draining {size} bytes");
    Ok(())
}

#[cfg(target_os = "linux")]
fn read_process_memory(address: u64, size: usize) -> Option<Vec<u8>> {
    use nix::sys::uio::{process_vm_readv, RemoteIoVec};
    use std::io::IoSliceMut;

    let mut data = vec![0u8; size];
    if size == 0 {
        return Some(data);
    }
    let remote = [RemoteIoVec {
        base: address as usize,
        len: size,
    }];
    let mut local = [IoSliceMut::new(&mut data)];
    match process_vm_readv(nix::unistd::getpid(), &mut local, &remote) {
        Ok(n) if n == size => Some(data),
        _ => None,
    }
}

#[cfg(target_os = "linux")]
fn write_process_memory(address: u64, data: &[u8]) -> bool {
    use nix::sys::uio::{process_vm_writev, RemoteIoVec};
    use std::io::IoSlice;

    if data.is_empty() {
        return true;
    }
    let remote = [RemoteIoVec {
        base: address as usize,
        len: data.len(),
    }];
    let local = [IoSlice::new(data)];
    matches!(
        process_vm_writev(nix::unistd::getpid(), &local, &remote),
        Ok(n) if n == data.len()
    )
}

#[cfg(not(target_os = "linux"))]
fn read_process_memory(address: u64, size: usize) -> Option<Vec<u8>> {
    let mut data = vec![0u8; size];
    unsafe { std::ptr::copy_nonoverlapping(address as *const u8, data.as_mut_ptr(), size) };
    Some(data)
}

#[cfg(not(target_os = "linux"))]
fn write_process_memory(address: u64, data: &[u8]) -> bool {
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len()) };
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_own_buffer() {
        let buf = *b"0123456789abcdef";
        let data = read_process_memory(buf.as_ptr() as u64, buf.len()).unwrap();
        assert_eq!(data, buf);
    }

    #[test]
    fn poke_then_peek_round_trips() {
        let mut target = [0u8; 8];
        let addr = target.as_mut_ptr() as u64;
        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
        assert!(write_process_memory(addr, &payload));
        let data = read_process_memory(addr, 8).unwrap();
        assert_eq!(data, payload);
    }

    #[test]
    fn zero_length_transfers_succeed() {
        assert_eq!(read_process_memory(0, 0).unwrap(), Vec::<u8>::new());
        assert!(write_process_memory(0, &[]));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn peek_unmapped_address_fails() {
        // the zero page is never mapped
        assert!(read_process_memory(16, 64).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn poke_unmapped_address_fails() {
        assert!(!write_process_memory(16, &[1, 2, 3]));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn poke_read_only_page_fails() {
        static RODATA: &str = "immutable";
        assert!(!write_process_memory(RODATA.as_ptr() as u64, &[0]));
    }
}
