pub mod frame_allocator;
pub mod paging;

pub use frame_allocator::{PhysMemory, PhysPageNum};
pub use paging::{copy_in, copy_in_cstr, copy_out, ensure_writable, user_store, PageTable, Pte, PteFlags};
