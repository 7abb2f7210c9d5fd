pub mod flash;
pub mod fs;
pub mod protocol;

pub use flash::{FlashDevice, FlashStatus, ImageFile};
pub use fs::{FileEntry, FsStatus, SimpleFs};
pub use protocol::{Command, HostLink};
