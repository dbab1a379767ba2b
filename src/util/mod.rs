pub mod auto_reset_event;
pub mod cancel;
pub mod latch;
pub mod merge_cell;
pub mod once_flag;
