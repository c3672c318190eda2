//! Behavioural coverage for archive persistence through real files.

use std::fs::File;

use geo::Coord;
use mapedit_core::{EntityRef, MapData, Tags, read_archive, write_archive};
use rstest::rstest;

fn provider() -> mapedit_core::CommentContextProvider {
    Box::new(|_| Tags::new())
}

#[rstest]
fn saving_and_reloading_resumes_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.mped");

    let mut map = MapData::new(provider());
    let node = map.create_node(Coord { x: -0.1, y: 51.5 }).unwrap();
    let way = map.create_way();
    map.add_way_node(way, node, 0).unwrap();
    let mut tags = Tags::new();
    tags.insert("highway".to_owned(), "footway".to_owned());
    map.set_tags(EntityRef::way(way), tags.clone()).unwrap();

    write_archive(&map, File::create(&path).unwrap()).unwrap();
    let mut restored = read_archive(File::open(&path).unwrap(), provider()).unwrap();

    assert_eq!(restored.way(way).unwrap().tags, tags);
    assert_eq!(restored.way(way).unwrap().nodes, vec![node]);

    // Editing resumes: undo history survived, and the allocator does not
    // reuse identifiers that were handed out before saving.
    restored.undo().unwrap();
    assert!(restored.way(way).unwrap().tags.is_empty());
    assert_eq!(
        restored.create_node(Coord { x: 0.0, y: 0.0 }).unwrap(),
        -2
    );
}

#[rstest]
fn garbage_on_disk_does_not_build_a_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.mped");
    std::fs::write(&path, b"not an archive at all").unwrap();

    let result = read_archive(File::open(&path).unwrap(), provider());
    assert!(matches!(
        result,
        Err(mapedit_core::ArchiveError::CorruptData { .. })
    ));
}
