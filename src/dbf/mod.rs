pub mod picker;
pub mod reader;
pub mod writer;

pub use picker::{pick_table, TableLayout, TablePick};
pub use reader::{DbfTable, FieldDescriptor, FieldValue, TextCodec, TextEncoding};
pub use writer::{write_dbf, ColumnSpec, ColumnType};
