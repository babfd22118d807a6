use std::io::Write;

use region::Protection;
use rtpatch::config::ConfigFile;
use rtpatch::dispatch::{
    DispatchState, Dispatcher, ModuleContext, PatchCatalog, PatchSet, StaticPatchSet, VersionInfo,
};
use rtpatch::hook::{FunctionPointer, Opcode};
use rtpatch::memory::local::LocalMemory;
use rtpatch::memory::mock::MockMemory;
use rtpatch::memory::{Address, MemoryAccessor};
use rtpatch::patcher::{PatchEngine, PatchFailure, PatchResult};

/// Three independent patches, the second of which can't apply
#[derive(Default)]
struct ThreePatches {
    /// Results of the last `apply`
    results: Vec<PatchResult>,
}

impl<M: MemoryAccessor> PatchSet<M> for ThreePatches {
    fn name(&self) -> &str {
        "three patches"
    }

    fn applicable(&self, context: &ModuleContext) -> bool {
        context.executable_name == "tomb"
    }

    fn apply(&mut self, engine: &mut PatchEngine<M>, _context: &ModuleContext) {
        self.results = vec![
            engine.patch_hex(Address::new(0x1000), "C3 90 90 90", "31 C0 40 C3"),
            engine.patch_hex(Address::new(0x2000), "74 0A", "EB 0A"),
            engine.patch_call(
                Address::new(0x3000),
                "E8 00 00 00 00",
                FunctionPointer::from_raw(0x5000),
                Opcode::Call,
            ),
        ];
    }
}

/// Address space for [`ThreePatches`], with unexpected bytes at the second site
fn memory() -> MockMemory {
    MockMemory::new()
        .map_hex(0x1000, "C3 90 90 90", Protection::READ_EXECUTE)
        .map_hex(0x2000, "75 0A", Protection::READ_EXECUTE)
        .map_hex(0x3000, "E8 00 00 00 00", Protection::READ_EXECUTE)
}

#[test]
/// A failing patch leaves the patches before and after it alone
fn test_continue_on_failure() {
    let mut set = ThreePatches::default();
    let mut engine = PatchEngine::new(memory());
    set.apply(&mut engine, &ModuleContext::new("tomb", Default::default()));

    let succeeded: Vec<_> = set.results.iter().map(PatchResult::succeeded).collect();
    assert_eq!(succeeded, [true, false, true]);
    assert_eq!(set.results[1].failure, Some(PatchFailure::VerificationMismatch));

    let memory = engine.memory();
    assert_eq!(memory.peek(0x1000, 4).unwrap().to_hex(), "31 C0 40 C3");
    assert_eq!(memory.peek(0x2000, 2).unwrap().to_hex(), "75 0A");
    assert_eq!(memory.peek(0x3000, 5).unwrap().to_hex(), "E8 FB 1F 00 00");
    assert!(memory
        .protections()
        .values()
        .all(|protection| *protection == Protection::READ_EXECUTE));
}

#[test]
/// Settings and catalog from disk drive a whole dispatch
fn test_dispatch_from_files() {
    let dir = tempfile::tempdir().unwrap();

    let settings_path = dir.path().join("rtpatch.toml");
    let mut settings = std::fs::File::create(&settings_path).unwrap();
    writeln!(settings, "patch_set = \"ar-1.0\"\n\n[ar]\nresolution_override = false").unwrap();
    drop(settings);

    let set_path = dir.path().join("ar.toml");
    std::fs::write(
        &set_path,
        r#"
        name = "Assault Rigs"
        executable = "ar"
        version = "1.0.0.0"

        [[patch]]
        address = 0x434B63
        expected = "0F 8E 32 01 00 00"
        replacement = "90 90 90 90 90 90"

        [[patch]]
        address = 0x486AC0
        expected = "36 34 30 20 42 59 20 34 38 30"
        replacement = "43 55 53 54 4F 4D 20 20 20 20"
        config = "resolution_override"
        "#,
    )
    .unwrap();

    let settings = ConfigFile::load(&settings_path).unwrap();
    let set = StaticPatchSet::load(&set_path).unwrap();
    assert_eq!(set.version, Some(VersionInfo::new(1, 0, 0, 0)));

    let mut catalog = PatchCatalog::new();
    catalog
        .register_default::<ThreePatches>("tomb")
        .register("ar-1.0", move || Box::new(set.clone()));

    // the version doesn't match, the configured set is applied anyway
    let context = ModuleContext::new("ar", settings.for_module("ar"));
    let mut dispatcher = Dispatcher::new(catalog);
    dispatcher.identify(context).unwrap();
    assert_eq!(dispatcher.select().unwrap(), Some("ar-1.0"));

    let memory = MockMemory::new()
        .map_hex(0x434B63, "0F 8E 32 01 00 00", Protection::READ_EXECUTE)
        .map_hex(0x486AC0, "36 34 30 20 42 59 20 34 38 30", Protection::READ);
    let mut engine = PatchEngine::new(memory);
    let state = dispatcher.apply(&mut engine).unwrap();

    assert!(matches!(state, DispatchState::Applied(tally) if tally.attempted == 1 && tally.succeeded == 1));
    assert_eq!(
        engine.memory().peek(0x486AC0, 10).unwrap().to_hex(),
        "36 34 30 20 42 59 20 34 38 30"
    );
}

/// Patches two bytes of a page the test allocated
struct RealPage {
    /// Start of the page
    base: usize,
}

impl PatchSet<LocalMemory> for RealPage {
    fn name(&self) -> &str {
        "real page"
    }

    fn applicable(&self, _context: &ModuleContext) -> bool {
        true
    }

    fn apply(&mut self, engine: &mut PatchEngine<LocalMemory>, _context: &ModuleContext) {
        engine.patch_hex(Address::new(self.base + 0x10), "CC CC", "33 C0");
    }
}

#[test]
/// The engine patches real read-only pages and puts their protection back
fn test_local_memory_dispatch() {
    let mut allocation = region::alloc(region::page::size(), Protection::READ_WRITE).unwrap();
    let base = allocation.as_mut_ptr::<u8>() as usize;
    unsafe {
        std::ptr::write_bytes(allocation.as_mut_ptr::<u8>(), 0xCC, allocation.len());
        region::protect(allocation.as_ptr::<u8>(), allocation.len(), Protection::READ).unwrap();
    }

    let mut catalog = PatchCatalog::new();
    catalog.register("page", move || Box::new(RealPage { base }));
    let mut dispatcher = Dispatcher::new(catalog);
    dispatcher
        .identify(ModuleContext::new("host", Default::default()))
        .unwrap();

    let mut engine = PatchEngine::new(unsafe { LocalMemory::new() });
    let state = dispatcher.run(&mut engine).unwrap().clone();
    assert!(matches!(state, DispatchState::Applied(tally) if tally.succeeded == 1));

    let patched = unsafe { std::slice::from_raw_parts((base + 0x10) as *const u8, 3) };
    assert_eq!(patched, [0x33, 0xC0, 0xCC]);
    assert_eq!(
        region::query(allocation.as_ptr::<u8>()).unwrap().protection(),
        Protection::READ
    );
}
