//! Method profiling data.
//!
//! The runtime owns the profiling buffers; the compiler only reads them.
//! A buffer is a sequence of tagged records. [`AccessorTable`] maps a tag
//! to the [`ProfileAccessor`] that knows the record's size and meaning, and
//! [`MethodData`] walks the buffer using offsets from one validated
//! [`ProfileLayout`].
//!
//! # Example
//!
//! ```ignore
//! use kiln_runtime::profile::{AccessorTable, MethodData, ProfileLayout};
//!
//! let layout = ProfileLayout::default();
//! layout.validate()?;
//! let table = AccessorTable::standard();
//! let data = MethodData::new(&bytes, &layout, &table)?;
//! for record in data.normal_records()? {
//!     println!("bci {} -> {}", record.bci, record.accessor.name());
//! }
//! ```

mod accessor;
mod layout;
mod method_data;
mod table;

pub use accessor::{
    ArgInfoData, BitData, BranchData, CounterData, DataTag, JumpData, MethodProfile,
    MultiBranchData, NoData, OpaqueData, ProfileAccessor, ProfiledItem, ReceiverTypeData, RetData,
    TriState, TypeProfile, VirtualCallData, VirtualCallTypeData,
};
pub use layout::ProfileLayout;
pub use method_data::{MethodData, MethodDataBuilder, ProfileRecord};
pub use table::AccessorTable;
