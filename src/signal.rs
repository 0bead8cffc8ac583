use anyhow::{Context, Result, bail};
use maolan_duplex_engine::StopFlag;
use nix::libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::sync::OnceLock;

static STOP: OnceLock<StopFlag> = OnceLock::new();

extern "C" fn on_sigint(_: c_int) {
    if let Some(flag) = STOP.get() {
        flag.stop();
    }
}

/// Raises `flag` on the first SIGINT. The handler resets itself, so a
/// second SIGINT terminates the process.
pub fn install(flag: StopFlag) -> Result<()> {
    if STOP.set(flag).is_err() {
        bail!("SIGINT handler already installed");
    }
    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }.context("cannot install SIGINT handler")?;
    Ok(())
}
