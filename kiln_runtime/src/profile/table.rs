//! Tag-indexed accessor table.

use super::accessor::{
    ArgInfoData, BitData, BranchData, CounterData, DataTag, JumpData, MultiBranchData, NoData,
    OpaqueData, ProfileAccessor, ReceiverTypeData, RetData, TriState, VirtualCallData,
    VirtualCallTypeData,
};
use kiln_core::{KilnError, KilnResult};

static NO_DATA_NO_EXCEPTION: NoData = NoData {
    exception_seen: TriState::False,
};
static NO_DATA_EXCEPTION_UNKNOWN: NoData = NoData {
    exception_seen: TriState::Unknown,
};

/// Accessors indexed by tag. Slot 0 (`NoTag`) is empty and marks the end of
/// the extra-data area.
#[derive(Debug)]
pub struct AccessorTable {
    accessors: Vec<Option<Box<dyn ProfileAccessor>>>,
}

impl AccessorTable {
    /// The table for the standard record kinds.
    pub fn standard() -> Self {
        let accessors: Vec<Option<Box<dyn ProfileAccessor>>> = vec![
            None,
            Some(Box::new(BitData)),
            Some(Box::new(CounterData)),
            Some(Box::new(JumpData)),
            Some(Box::new(ReceiverTypeData)),
            Some(Box::new(VirtualCallData)),
            Some(Box::new(RetData)),
            Some(Box::new(BranchData)),
            Some(Box::new(MultiBranchData)),
            Some(Box::new(ArgInfoData)),
            Some(Box::new(OpaqueData {
                tag: DataTag::CallTypeData,
            })),
            Some(Box::new(VirtualCallTypeData)),
            Some(Box::new(OpaqueData {
                tag: DataTag::ParametersTypeData,
            })),
            Some(Box::new(OpaqueData {
                tag: DataTag::SpeculativeTrapData,
            })),
        ];
        Self { accessors }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.accessors.len()
    }

    /// Whether the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.accessors.is_empty()
    }

    /// Accessor for `tag` read at `position`. `NoTag` yields `None`; a tag
    /// beyond the table is an internal error.
    pub fn lookup(&self, tag: u8, position: usize) -> KilnResult<Option<&dyn ProfileAccessor>> {
        match self.accessors.get(tag as usize) {
            Some(slot) => Ok(slot.as_deref()),
            None => Err(KilnError::UnknownProfileTag { tag, position }),
        }
    }

    /// Shared accessor for sites without a record.
    pub fn no_data(exception_possibly_not_recorded: bool) -> &'static dyn ProfileAccessor {
        if exception_possibly_not_recorded {
            &NO_DATA_EXCEPTION_UNKNOWN
        } else {
            &NO_DATA_NO_EXCEPTION
        }
    }

    /// Check that every slot holds the accessor for its own index.
    pub fn check_accessor_tags(&self) -> KilnResult<()> {
        for (index, slot) in self.accessors.iter().enumerate() {
            match (index, slot) {
                (0, None) => {}
                (0, Some(accessor)) => {
                    return Err(KilnError::internal(format!(
                        "slot 0 must be empty, found {}",
                        accessor.name()
                    )))
                }
                (_, None) => {
                    return Err(KilnError::internal(format!("missing accessor for tag {index}")))
                }
                (_, Some(accessor)) if accessor.tag().as_u8() as usize != index => {
                    return Err(KilnError::internal(format!(
                        "{} != {} {}",
                        index,
                        accessor.tag().as_u8(),
                        accessor.name()
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Default for AccessorTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table_tags_match() {
        let table = AccessorTable::standard();
        assert_eq!(table.len(), DataTag::COUNT);
        assert!(table.check_accessor_tags().is_ok());
    }

    #[test]
    fn test_lookup_no_tag_is_none() {
        let table = AccessorTable::standard();
        assert!(table.lookup(0, 0).unwrap().is_none());
        assert_eq!(table.lookup(7, 0).unwrap().map(|a| a.tag()), Some(DataTag::BranchData));
    }

    #[test]
    fn test_unknown_tag_is_hard_error() {
        let table = AccessorTable::standard();
        match table.lookup(200, 48) {
            Err(KilnError::UnknownProfileTag { tag, position }) => {
                assert_eq!(tag, 200);
                assert_eq!(position, 48);
            }
            other => panic!("expected unknown tag error, got {:?}", other.map(|a| a.map(|a| a.name()))),
        }
    }

    #[test]
    fn test_no_data_accessors() {
        assert_eq!(AccessorTable::no_data(false).tag(), DataTag::NoTag);
        assert_eq!(AccessorTable::no_data(true).name(), "NoMethodData");
    }
}
