pub mod aufs;
pub mod cancel;
pub mod error;
pub mod filter;
pub mod header;
pub mod notifier;
pub mod overlay;
pub mod pack;
pub mod paths;
pub mod unpack;
pub mod whiteout;

mod sys;

// Re-exports for easy access
pub use aufs::AufsWhiteouts;
pub use cancel::CancelToken;
pub use error::{Result, TarError};
pub use filter::{filter_tar, Action, TarFilter};
pub use header::{read_headers, EntryHeader, EntryKind, HeaderWriter, TarSink};
pub use notifier::Notifier;
pub use overlay::OverlayWhiteouts;
pub use pack::pack;
pub use unpack::{open_and_unpack, open_and_unpack_multi, unpack, UnpackOptions};
