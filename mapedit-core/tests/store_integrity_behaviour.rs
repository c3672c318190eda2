//! Behavioural coverage for referential integrity across merges, remaps,
//! and deletions.

use geo::Coord;
use mapedit_core::{
    EntityRef, EntitySet, IdRemap, MapData, Member, Node, Relation, RemoteInfo, SyncConfirmation,
    Tags, Way,
};
use rstest::{fixture, rstest};

#[fixture]
fn map() -> MapData {
    MapData::new(Box::new(|_| Tags::new()))
}

fn remote_node(id: i64, lon: f64, lat: f64) -> Node {
    let mut node = Node::new(id, Coord { x: lon, y: lat }).unwrap();
    node.remote = Some(RemoteInfo {
        version: 1,
        changeset: 100,
    });
    node
}

fn downloaded_block() -> EntitySet {
    let mut way = Way::new(30);
    way.nodes = vec![1, 2];
    way.remote = Some(RemoteInfo {
        version: 2,
        changeset: 100,
    });
    let mut relation = Relation::new(50);
    relation.members = vec![Member::new(EntityRef::way(30), "outer")];
    relation.remote = Some(RemoteInfo {
        version: 1,
        changeset: 100,
    });
    EntitySet {
        nodes: vec![remote_node(1, 13.40, 52.50), remote_node(2, 13.41, 52.51)],
        ways: vec![way],
        relations: vec![relation],
    }
}

#[rstest]
fn download_merge_is_integral_and_undoable(mut map: MapData) {
    let outcome = map.merge_remote(&downloaded_block()).unwrap();
    assert_eq!(outcome.applied, 4);
    assert!(outcome.skipped.is_empty());
    map.check_integrity().unwrap();

    // A download merge is one undo group.
    map.undo().unwrap();
    assert_eq!(map.node_count() + map.way_count() + map.relation_count(), 0);
}

#[rstest]
fn placeholder_remap_leaves_no_stale_references(mut map: MapData) {
    map.merge_remote(&downloaded_block()).unwrap();
    let new_node = map.create_node(Coord { x: 13.42, y: 52.52 }).unwrap();
    map.add_way_node(30, new_node, 2).unwrap();
    let new_relation = map.create_relation();
    map.add_member(
        new_relation,
        Member::new(EntityRef::node(new_node), "stop"),
        0,
    )
    .unwrap();

    let mut remap = IdRemap::default();
    remap.nodes.insert(new_node, 42);
    remap.relations.insert(new_relation, 60);
    map.apply_id_map(&remap).unwrap();

    assert!(map.node(new_node).is_none());
    assert_eq!(map.way(30).unwrap().nodes, vec![1, 2, 42]);
    assert_eq!(
        map.relation(60).unwrap().members,
        vec![Member::new(EntityRef::node(42), "stop")]
    );
    assert!(map.referrers(EntityRef::node(new_node)).is_empty());
    map.check_integrity().unwrap();
}

#[rstest]
fn merge_refusing_cyclic_relations_keeps_store_clean(mut map: MapData) {
    let mut first = Relation::new(70);
    first.members = vec![Member::new(EntityRef::relation(71), "")];
    let mut second = Relation::new(71);
    second.members = vec![Member::new(EntityRef::relation(70), "")];
    let set = EntitySet {
        relations: vec![first, second],
        ..EntitySet::default()
    };

    assert!(map.merge_remote(&set).is_err());
    assert_eq!(map.relation_count(), 0);
}

#[rstest]
fn deleting_a_way_leaves_its_nodes_alone(mut map: MapData) {
    map.merge_remote(&downloaded_block()).unwrap();
    // The way is held by relation 50, so deleting it needs cascade.
    assert!(map.delete(EntityRef::way(30), false).is_err());
    map.delete(EntityRef::way(30), true).unwrap();

    assert!(map.way(30).unwrap().deleted, "synchronized way tombstones");
    assert!(map.relation(50).unwrap().members.is_empty());
    assert!(map.node(1).is_some());
    assert!(map.node(2).is_some());
    map.check_integrity().unwrap();
}

#[rstest]
fn pending_edits_track_the_upload_lifecycle(mut map: MapData) {
    map.merge_remote(&downloaded_block()).unwrap();
    assert!(map.pending_edits().is_empty());

    let created = map.create_node(Coord { x: 0.0, y: 0.0 }).unwrap();
    let mut tags = Tags::new();
    tags.insert("name".to_owned(), "corner".to_owned());
    map.set_tags(EntityRef::node(1), tags).unwrap();
    map.delete(EntityRef::node(2), true).unwrap();

    let pending = map.pending_edits();
    assert_eq!(pending.created, vec![EntityRef::node(created)]);
    assert_eq!(pending.modified, vec![EntityRef::node(1), EntityRef::way(30)]);
    assert_eq!(pending.deleted, vec![EntityRef::node(2)]);

    let mut confirmation = SyncConfirmation {
        changeset: 101,
        ..SyncConfirmation::default()
    };
    confirmation.remap.nodes.insert(created, 3);
    confirmation.versions.push((EntityRef::node(3), 1));
    confirmation.versions.push((EntityRef::node(1), 2));
    confirmation.versions.push((EntityRef::way(30), 3));
    confirmation.deleted.push(EntityRef::node(2));
    map.confirm_sync(&confirmation).unwrap();

    assert!(map.pending_edits().is_empty());
    assert!(map.node(2).is_none());
    map.check_integrity().unwrap();
}
