pub mod configure;
pub mod error;
pub mod hw;
pub mod poll;
pub mod recovery;
pub mod region;
pub mod rt;
pub mod session;
pub mod stream;
pub mod worker;

pub use configure::configure;
pub use error::{Error, HwError, Result};
pub use hw::{Direction, RunConfig};
pub use poll::{Readiness, Stall};
pub use recovery::{RecoveryPolicy, XrunReport};
pub use region::{Payload, PeriodRegion, Silence};
pub use rt::Scheduling;
pub use session::{DuplexSession, SessionStats};
pub use stream::{Negotiated, Stream};
pub use worker::{RunReport, StopFlag, run, run_session};
