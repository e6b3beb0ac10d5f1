//! Property: header rejection
//!
//! Any input whose first four bytes are not the ELF magic is rejected with a
//! format error before a table is read; any input whose class byte is not
//! ELFCLASS64 is rejected even when its tables are well formed. Neither case
//! creates a region.

use elfload::elf::{EI_CLASS, ELFCLASS64, ELF_MAGIC};
use elfload::fixture::ElfBuilder;
use elfload::{ErrorClass, LoadError, LoadState, Loader, LoaderOptions, SimulatedAddressSpace};
use proptest::prelude::*;

fn well_formed() -> Vec<u8> {
    ElfBuilder::executable(0x401000)
        .load(0x5, 0x401000, &[0xC3; 128], 128)
        .section(".text", 1, 0x6, 0x401000, &[0xC3; 128])
        .build()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Any non-magic prefix yields BadMagic, whatever follows it.
    #[test]
    fn non_magic_prefix_is_rejected(
        prefix in prop::array::uniform4(any::<u8>()),
        tail in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        prop_assume!(prefix != ELF_MAGIC);
        let mut input = prefix.to_vec();
        input.extend_from_slice(&tail);

        let mut loader = Loader::new(
            &input,
            LoaderOptions::default(),
            SimulatedAddressSpace::default(),
            Vec::<String>::new(),
        );
        let err = loader.load().unwrap_err();
        prop_assert!(matches!(err, LoadError::BadMagic { .. }), "got {err}");
        prop_assert_eq!(err.class(), ErrorClass::Format);
        prop_assert_eq!(loader.state(), LoadState::Aborted);
        prop_assert_eq!(loader.space().page_count(), 0);
        prop_assert!(loader.report().is_empty());
    }

    /// Any class other than ELFCLASS64 yields UnsupportedClass.
    #[test]
    fn non_64bit_class_is_rejected(class in any::<u8>(), dry_run in any::<bool>()) {
        prop_assume!(class != ELFCLASS64);
        let mut input = well_formed();
        input[EI_CLASS] = class;

        let options = LoaderOptions { dry_run, ..Default::default() };
        let mut loader = Loader::new(
            &input,
            options,
            SimulatedAddressSpace::default(),
            Vec::<String>::new(),
        );
        let err = loader.load().unwrap_err();
        let LoadError::UnsupportedClass { class: found } = err else {
            return Err(TestCaseError::fail(format!("expected UnsupportedClass, got {err}")));
        };
        prop_assert_eq!(found, class);
        prop_assert_eq!(loader.state(), LoadState::Aborted);
        prop_assert_eq!(loader.space().page_count(), 0);
    }
}
