mod entry;
mod wantlist;

pub use entry::{Entry, WantType};
pub use wantlist::WantList;
