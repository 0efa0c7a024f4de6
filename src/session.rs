//! Per-connection handshake and command dispatch.
//!
//! On accept the server announces its magic/version word and the OS name,
//! then loops: read one frame header, route to the handler, repeat. While
//! an interactive EXEC runs the handler owns the socket outright and the
//! dispatcher reads nothing. A CLOSE command or an orderly disconnect ends
//! the loop; a bad header or a handler failure mid-payload tears the
//! connection down, since the stream can no longer be resynchronized.

use anyhow::bail;
use byteorder::{LittleEndian, WriteBytesExt};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::ffi::OsStrExt;
use tracing::{debug, info, warn};

use crate::protocol::{self, CmdType, OS_NAME_LEN, SERVER_MAGIC_VERSION};
use crate::transport::{self, TransportError};
use crate::{exec, gadget, loader, memory};

/// Serve one client until it closes, disconnects, or breaks the protocol.
pub fn serve(mut stream: TcpStream, peer: SocketAddr) {
    debug!(%peer, "session started");
    match run(&mut stream, &peer) {
        Ok(()) => info!(%peer, "session ended"),
        Err(e) => warn!(%peer, error = %e, "session ended with error"),
    }
}

fn run(stream: &mut TcpStream, peer: &SocketAddr) -> anyhow::Result<()> {
    handshake(stream)?;

    loop {
        let mut header = [0u8; 8];
        match transport::recv_all_or_close(stream, &mut header) {
            Ok(()) => {}
            Err(TransportError::Disconnected) => {
                debug!(%peer, "client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let cmd = protocol::parse_header(&header)?;
        debug!(%peer, cmd = ?cmd, "dispatch");

        match cmd {
            CmdType::Exec => exec::handle(stream)?,
            CmdType::Dlopen => loader::handle_dlopen(stream)?,
            CmdType::Dlclose => loader::handle_dlclose(stream)?,
            CmdType::Dlsym => loader::handle_dlsym(stream)?,
            CmdType::Call => gadget::handle(stream)?,
            CmdType::Peek => memory::handle_peek(stream)?,
            CmdType::Poke => memory::handle_poke(stream)?,
            CmdType::GetDummyBlock => memory::handle_get_dummy_block(stream)?,
            CmdType::Close => {
                debug!(%peer, "close requested");
                return Ok(());
            }
            CmdType::ReplyError | CmdType::ReplyPeek | CmdType::ReplyPoke => {
                bail!("client sent server-only tag {:?}", cmd);
            }
        }
    }
}

/// Emit the fixed-size greeting: the magic/version word, then the OS name
/// NUL-padded to 256 bytes. Exactly 260 bytes leave before the first
/// command is accepted.
fn handshake(stream: &mut TcpStream) -> anyhow::Result<()> {
    let mut greeting = Vec::with_capacity(4 + OS_NAME_LEN);
    greeting.write_u32::<LittleEndian>(SERVER_MAGIC_VERSION)?;

    let uts = nix::sys::utsname::uname()?;
    let sysname = uts.sysname().as_bytes();
    let mut os_name = [0u8; OS_NAME_LEN];
    let n = sysname.len().min(OS_NAME_LEN - 1);
    os_name[..n].copy_from_slice(&sysname[..n]);
    greeting.extend_from_slice(&os_name);

    transport::send_all(stream, &greeting)?;
    Ok(())
}
