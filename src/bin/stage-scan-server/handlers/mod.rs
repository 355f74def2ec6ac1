pub mod align;
pub mod catalog;
pub mod common;
pub mod scan;
pub mod table;

pub(crate) use align::handle_align_start;
pub(crate) use catalog::{handle_catalog, handle_catalog_reload};
pub(crate) use scan::{
    handle_scan_cancel, handle_scan_load, handle_scan_save, handle_scan_start, handle_scan_state,
    handle_scan_stream,
};
pub(crate) use table::{handle_table, handle_table_update};
