//! CALL: invoke an arbitrary code address with 0..=11 word arguments.
//!
//! The callee's signature is erased to a family of `extern "C"` function
//! types taking and returning register-width integers, one per arity,
//! generated below. Nothing validates that the address points at code or
//! that the signature is honored; that is the client's obligation, and a
//! bad call takes the whole process down.

use byteorder::{LittleEndian, WriteBytesExt};
use std::net::TcpStream;
use tracing::{debug, warn};

use crate::protocol::{self, MAX_CALL_ARGS};

/// One match arm per arity; `@ty` just maps each bound word to `u64` so the
/// function type can be spelled from the argument list itself.
macro_rules! arity_dispatch {
    (@ty $_a:ident) => { u64 };
    ($addr:expr, $args:expr; $( ($($a:ident),*) )*) => {
        match $args {
            $(
                &[$($a),*] => {
                    let f: unsafe extern "C" fn($(arity_dispatch!(@ty $a)),*) -> u64 =
                        core::mem::transmute($addr as *const ());
                    f($($a),*)
                }
            )*
            _ => 0,
        }
    };
}

/// Invoke `address` with the given argument words, returning the register
/// the callee left its result in.
///
/// # Safety
///
/// `address` must point to callable code following the platform's default C
/// convention for this arity, and every argument word must be valid for the
/// callee. An access violation is not recoverable.
pub unsafe fn invoke(address: u64, args: &[u64]) -> i64 {
    let ret = arity_dispatch!(address, args;
        ()
        (a)
        (a, b)
        (a, b, c)
        (a, b, c, d)
        (a, b, c, d, e)
        (a, b, c, d, e, f)
        (a, b, c, d, e, f, g)
        (a, b, c, d, e, f, g, h)
        (a, b, c, d, e, f, g, h, i)
        (a, b, c, d, e, f, g, h, i, j)
        (a, b, c, d, e, f, g, h, i, j, k)
    );
    ret as i64
}

pub fn handle(stream: &mut TcpStream) -> anyhow::Result<()> {
    let req = protocol::read_call_request(stream)?;
    let ret = if req.argc <= MAX_CALL_ARGS {
        debug!(address = req.address, argc = req.argc, "call");
        unsafe { invoke(req.address, &req.args) }
    } else {
        // announced words were already drained; perform no call
        warn!(argc = req.argc, "call arity out of range");
        0
    };
    stream.write_i64::<LittleEndian>(ret)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn nullary() -> u64 {
        42
    }

    extern "C" fn sum2(a: u64, b: u64) -> u64 {
        a + b
    }

    #[allow(clippy::too_many_arguments)]
    extern "C" fn sum11(
        a: u64,
        b: u64,
        c: u64,
        d: u64,
        e: u64,
        f: u64,
        g: u64,
        h: u64,
        i: u64,
        j: u64,
        k: u64,
    ) -> u64 {
        a + b + c + d + e + f + g + h + i + j + k
    }

    extern "C" fn negate(a: u64) -> u64 {
        (-(a as i64)) as u64
    }

    #[test]
    fn arity_zero() {
        let addr = nullary as extern "C" fn() -> u64 as usize as u64;
        assert_eq!(unsafe { invoke(addr, &[]) }, 42);
    }

    #[test]
    fn arity_two() {
        let addr = sum2 as extern "C" fn(u64, u64) -> u64 as usize as u64;
        assert_eq!(unsafe { invoke(addr, &[40, 2]) }, 42);
    }

    #[test]
    fn arity_eleven_reaches_the_stack_args() {
        let addr = sum11
            as extern "C" fn(u64, u64, u64, u64, u64, u64, u64, u64, u64, u64, u64) -> u64
            as usize as u64;
        let args: Vec<u64> = (1..=11).collect();
        assert_eq!(unsafe { invoke(addr, &args) }, 66);
    }

    #[test]
    fn result_is_sign_preserving() {
        let addr = negate as extern "C" fn(u64) -> u64 as usize as u64;
        assert_eq!(unsafe { invoke(addr, &[5]) }, -5);
    }

    #[test]
    fn over_arity_performs_no_call() {
        // address 0 would fault if dispatched
        assert_eq!(unsafe { invoke(0, &[0; 12]) }, 0);
    }
}
