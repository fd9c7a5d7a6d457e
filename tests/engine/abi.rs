use pystalker::engine::abi::{resolve, AbiError, BuildFlavor, Field};
use pystalker::version::{RuntimeVersion, VersionTag};
use strum::IntoEnumIterator;

/// Fields the trace path reads on every supported interpreter.
const REQUIRED: [Field; 11] = [
    Field::ObjectRefcnt,
    Field::ObjectType,
    Field::CodeFilename,
    Field::FrameBack,
    Field::FrameCode,
    Field::FrameTrace,
    Field::FrameLineno,
    Field::ThreadNext,
    Field::ThreadFrame,
    Field::ThreadTraceFunc,
    Field::ThreadId,
];

#[test]
fn test_every_version_resolves() {
    for version in RuntimeVersion::iter() {
        for flavor in [BuildFlavor::Release, BuildFlavor::Debug] {
            let layout = resolve(version.tag(), flavor)
                .unwrap_or_else(|e| panic!("{version} {flavor}: {e}"));
            assert_eq!(layout.version(), version);
            assert_eq!(layout.flavor(), flavor);

            for field in REQUIRED {
                let offset = layout.field_offset(field).unwrap();
                assert!(offset < 512, "{version} {flavor} {field}: {offset}");
            }
            for field in layout.fields() {
                assert!(layout.field_offset(field).is_ok());
            }
        }
    }
}

#[test]
fn test_thread_prev_only_on_doubly_linked_lists() {
    let old = resolve(VersionTag::new(3, 3), BuildFlavor::Release).unwrap();
    assert!(matches!(
        old.field_offset(Field::ThreadPrev),
        Err(AbiError::NoSuchField(Field::ThreadPrev, RuntimeVersion::V3_3))
    ));

    let new = resolve(VersionTag::new(3, 4), BuildFlavor::Release).unwrap();
    assert!(new.field_offset(Field::ThreadPrev).is_ok());
}

#[test]
fn test_offset_by_name() {
    let layout = resolve(VersionTag::new(3, 7), BuildFlavor::Release).unwrap();
    assert_eq!(
        layout.offset_by_name("frame.code").unwrap(),
        layout.field_offset(Field::FrameCode).unwrap()
    );
    assert_eq!(
        layout.offset_by_name("thread.threadId").unwrap(),
        layout.field_offset(Field::ThreadId).unwrap()
    );
    assert!(layout.offset_by_name("frame.nonexistent").is_err());
}

#[test]
fn test_unsupported_versions() {
    for tag in [
        VersionTag::new(2, 4),
        VersionTag::new(3, 11),
        VersionTag::new(4, 0),
    ] {
        for flavor in [BuildFlavor::Release, BuildFlavor::Debug] {
            assert!(
                matches!(resolve(tag, flavor), Err(AbiError::NotSupported(t, _)) if t == tag),
                "{tag}"
            );
        }
    }
}
