mod assert;
mod bytesize;
mod lockfile;
pub mod proc;

pub use bytesize::format_bytes;
pub use lockfile::LockedFile;
