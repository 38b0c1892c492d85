//! Internal error idiom used throughout the workspace.
//!
//! Most fallible operations below the public API boundary return
//! `Result<T, ()>`: the unit error carries no information of its own because
//! the call site that produced it has already logged a `warn!`/`error!` with
//! the relevant context. Use the `log` crate's macros as the value of the
//! `Err` arm directly (they evaluate to `()`) so the failure is explained and
//! constructed in the same expression:
//!
//! ```ignore
//! return Err(warn!("duplicate sequence number {seq:?}"));
//! ```
//!
//! Public entry points (`transport::Connection`, `transport::Multiplexer`)
//! convert these into a `TransportError` with the appropriate kind before
//! handing them to the caller.

use core::result;

pub type Result<T = (), E = ()> = result::Result<T, E>;

/// Extension for turning a `Result` into an `Option`, running a side effect
/// (typically a log call) on the error path.
#[doc(hidden)]
pub trait Ext<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T>;
}

impl<T, E> Ext<T, E> for result::Result<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T> {
		match self {
			Ok(v) => Some(v),
			Err(e) => {
				f(e);
				None
			}
		}
	}
}

pub use Ext as _;
