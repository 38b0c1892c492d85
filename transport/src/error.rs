//! The error taxonomy this transport surfaces, plus the per-thread "last
//! error" cache legacy callers expect.

use std::cell::RefCell;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Again {
	RcvAgain,
	SndAgain,
	XmTimeout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
	Setup(String),
	Connection(String),
	SysRes(String),
	FileErr(String),
	NotSup(String),
	Again(Again),
	PeerError(u16),
	/// Header shorter than the fixed 16-byte length.
	Malformed,
	/// Control type outside the recognized set and outside the
	/// user-defined range.
	UnknownType(u16),
	BufferFull,
	Duplicate,
}

impl fmt::Display for TransportError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransportError::Setup(m) => write!(f, "SETUP: {m}"),
			TransportError::Connection(m) => write!(f, "CONNECTION: {m}"),
			TransportError::SysRes(m) => write!(f, "SYSRES: {m}"),
			TransportError::FileErr(m) => write!(f, "FILEERR: {m}"),
			TransportError::NotSup(m) => write!(f, "NOTSUP: {m}"),
			TransportError::Again(Again::RcvAgain) => write!(f, "AGAIN: RCVAGAIN"),
			TransportError::Again(Again::SndAgain) => write!(f, "AGAIN: SNDAGAIN"),
			TransportError::Again(Again::XmTimeout) => write!(f, "AGAIN: XMTIMEOUT"),
			TransportError::PeerError(code) => write!(f, "PEERERROR: peer code {code}"),
			TransportError::Malformed => write!(f, "MALFORMED"),
			TransportError::UnknownType(t) => write!(f, "UNKNOWN_TYPE: {t}"),
			TransportError::BufferFull => write!(f, "BUFFER_FULL"),
			TransportError::Duplicate => write!(f, "DUPLICATE"),
		}
	}
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

thread_local! {
	static LAST_ERROR: RefCell<Option<TransportError>> = const { RefCell::new(None) };
}

/// Records `err` as this thread's last error and logs it in the same
/// call, so constructing an error and surfacing it in the logs never
/// drift apart.
pub fn set_last_error(err: TransportError) -> TransportError {
	log::warn!("{err}");
	LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(err.clone()));
	err
}

/// The last error observed by this thread, if any.
pub fn last_error() -> Option<TransportError> {
	LAST_ERROR.with(|cell| cell.borrow().clone())
}
