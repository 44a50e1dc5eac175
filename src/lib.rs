pub mod view;
pub mod header;
pub mod codec;
pub mod object;
pub mod hashchain;
pub mod fsprng;
pub mod seal;
pub mod writer;
pub mod verify;
pub mod attack;
pub mod harness;
pub mod error;

pub use view::{ByteView, Region};
pub use header::JournalHeader;
pub use object::{JournalScan, ObjectIndex, ObjectRecord};
pub use fsprng::FsKey;
pub use seal::MacChecker;
pub use writer::{JournalWriter, WriterOptions};
pub use verify::{verify, VerifyReport};
pub use attack::{AttackOptions, AttackReport, Attacker};
pub use error::{Error, Result};
