//! End-to-end exercises of a running engine: external POSIX mutations are
//! picked up by the watcher and assimilated, client operations run through
//! the tree surface, and both meet in the same id space.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::time::Instant;

use atriumfs::config::EngineConfig;
use atriumfs::engine::SpaceEngine;
use atriumfs::lookup::{Reference, SpaceType};
use atriumfs::metadata::{attr_str, attr_u64, attribute};
use atriumfs::node::{MetaNode, Node, NodeType};
use atriumfs::prelude::FsResult;

const SETTLE: Duration = Duration::from_secs(10);

struct Setup {
    _dir: tempfile::TempDir,
    engine: SpaceEngine,
    space: Node,
    root: PathBuf,
}

async fn engine_with_personal_space() -> Setup {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::with_root(dir.path());
    config.debounce_delay_ms = 50;

    let engine = SpaceEngine::builder(config).build().await.unwrap();
    let space = engine
        .tree()
        .provision_space(
            &SpaceType::Personal {
                username: "marie".into(),
            },
            "Marie",
        )
        .await
        .unwrap();
    let root = space.path().to_path_buf();

    // Let the watcher settle over the fresh directories.
    tokio::time::sleep(Duration::from_millis(100)).await;

    Setup {
        _dir: dir,
        engine,
        space,
        root,
    }
}

async fn eventually<T, F, Fut>(what: &str, mut condition: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + SETTLE;
    loop {
        if let Some(value) = condition().await {
            return value;
        }
        if Instant::now() >= deadline {
            panic!("{what} did not settle within {SETTLE:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn resolve(setup: &Setup, relative: &str) -> FsResult<Node> {
    setup
        .engine
        .lookup()
        .node_from_reference(&Reference::space_relative(setup.space.space_id(), relative))
        .await
}

async fn tree_size(setup: &Setup, relative: &str) -> Option<u64> {
    let path = if relative.is_empty() {
        setup.root.clone()
    } else {
        setup.root.join(relative)
    };
    let attrs = setup
        .engine
        .lookup()
        .metadata()
        .get_all_at(&setup.root, &path)
        .await
        .ok()?;
    attr_u64(&attrs, attribute::TREE_SIZE)
}

#[tokio::test]
async fn picks_up_a_new_file_created_behind_its_back() {
    let setup = engine_with_personal_space().await;

    std::fs::write(setup.root.join("assimilated.txt"), b"").unwrap();

    let node = eventually("external file assimilation", || async {
        resolve(&setup, "/assimilated.txt").await.ok()
    })
    .await;

    assert_eq!(node.kind(), NodeType::File);
    assert!(!node.id().as_str().is_empty());
    assert_eq!(node.blob_size(), 0);

    let attrs = setup
        .engine
        .lookup()
        .metadata()
        .get_all_at(&setup.root, &setup.root.join("assimilated.txt"))
        .await
        .unwrap();
    assert!(attr_str(&attrs, attribute::CHECKSUM_ADLER32).is_some_and(|cs| !cs.is_empty()));

    setup.engine.shutdown().await;
}

#[tokio::test]
async fn tracks_an_external_rename_without_changing_the_id() {
    let setup = engine_with_personal_space().await;

    std::fs::write(setup.root.join("original.txt"), b"x").unwrap();
    let original = eventually("initial assimilation", || async {
        resolve(&setup, "/original.txt").await.ok()
    })
    .await;
    let original_id = original.id().clone();

    std::fs::rename(
        setup.root.join("original.txt"),
        setup.root.join("moved.txt"),
    )
    .unwrap();

    let moved = eventually("rename tracking", || async {
        resolve(&setup, "/moved.txt").await.ok()
    })
    .await;
    assert_eq!(moved.id(), &original_id);

    eventually("old path forgotten", || async {
        match resolve(&setup, "/original.txt").await {
            Err(err) if err.is_not_found() => Some(()),
            _ => None,
        }
    })
    .await;

    setup.engine.shutdown().await;
}

#[tokio::test]
async fn resolves_an_id_clash_from_an_attribute_preserving_copy() {
    let setup = engine_with_personal_space().await;

    std::fs::write(setup.root.join("a.txt"), b"x").unwrap();
    let original = eventually("initial assimilation", || async {
        resolve(&setup, "/a.txt").await.ok()
    })
    .await;
    let original_id = original.id().clone();

    // Duplicate bytes and extended attributes, like `cp --preserve=xattr`.
    std::fs::write(setup.root.join("b.txt"), b"x").unwrap();
    for name in xattr::list(setup.root.join("a.txt")).unwrap() {
        if let Some(value) = xattr::get(setup.root.join("a.txt"), &name).unwrap() {
            xattr::set(setup.root.join("b.txt"), &name, &value).unwrap();
        }
    }

    let copy = eventually("clash resolution", || async {
        match resolve(&setup, "/b.txt").await {
            Ok(node) if node.id() != &original_id => Some(node),
            _ => None,
        }
    })
    .await;
    assert_ne!(copy.id(), &original_id);

    let still = resolve(&setup, "/a.txt").await.unwrap();
    assert_eq!(still.id(), &original_id);

    setup.engine.shutdown().await;
}

#[tokio::test]
async fn rolls_tree_sizes_up_to_the_personal_root() {
    let setup = engine_with_personal_space().await;

    std::fs::create_dir(setup.root.join("d")).unwrap();
    std::fs::write(setup.root.join("d/f.txt"), b"12345678901").unwrap();
    std::fs::write(setup.root.join("d/g.txt"), b"12345678901").unwrap();

    eventually("tree size roll-up", || async {
        let dir = tree_size(&setup, "d").await;
        let root = tree_size(&setup, "").await;
        (dir == Some(22) && root == Some(22)).then_some(())
    })
    .await;

    setup.engine.shutdown().await;
}

#[tokio::test]
async fn trash_roundtrip_preserves_identity_and_origin() {
    let setup = engine_with_personal_space().await;
    let space_id = setup.space.space_id().clone();
    let root_ref = Reference::from(setup.space.resource_id());

    let docs = setup.engine.tree().create_dir(&root_ref, "d").await.unwrap();
    let staged = setup.root.join("uploads/stage");
    std::fs::write(&staged, b"payload").unwrap();
    let file = setup
        .engine
        .tree()
        .finalize_upload(&Reference::from(docs.resource_id()), "f.txt", &staged)
        .await
        .unwrap();
    let original_id = file.id().clone();

    let key = setup
        .engine
        .tree()
        .delete(&Reference::from(file.resource_id()))
        .await
        .unwrap();

    let listed = setup
        .engine
        .tree()
        .list_recycle(&space_id, "", "")
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path, "d/f.txt");

    let restored = setup
        .engine
        .tree()
        .restore_recycle_item(&space_id, &key, "", None)
        .await
        .unwrap();
    assert_eq!(restored.id(), &original_id);

    let resolved = resolve(&setup, "/d/f.txt").await.unwrap();
    assert_eq!(resolved.id(), &original_id);
    assert!(setup
        .engine
        .tree()
        .list_recycle(&space_id, "", "")
        .await
        .unwrap()
        .is_empty());

    setup.engine.shutdown().await;
}

#[tokio::test]
async fn revision_restore_brings_back_the_old_content() {
    let setup = engine_with_personal_space().await;
    let root_ref = Reference::from(setup.space.resource_id());

    let staged = setup.root.join("uploads/stage-1");
    std::fs::write(&staged, b"v1").unwrap();
    let node = setup
        .engine
        .tree()
        .finalize_upload(&root_ref, "n.txt", &staged)
        .await
        .unwrap();
    let reference = Reference::from(node.resource_id());

    let staged = setup.root.join("uploads/stage-2");
    std::fs::write(&staged, b"v2").unwrap();
    setup
        .engine
        .tree()
        .finalize_upload(&root_ref, "n.txt", &staged)
        .await
        .unwrap();

    let listed = setup.engine.tree().list_revisions(&reference).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].size, 2);

    setup
        .engine
        .tree()
        .restore_revision(&reference, &listed[0].key)
        .await
        .unwrap();

    assert_eq!(std::fs::read(setup.root.join("n.txt")).unwrap(), b"v1");

    // The overwritten v2 state survives as a revision of its own.
    let listed = setup.engine.tree().list_revisions(&reference).await.unwrap();
    assert_eq!(listed.len(), 2);
    let mut newest = setup
        .engine
        .tree()
        .download_revision(&reference, &listed[0].key)
        .await
        .unwrap();
    let mut body = Vec::new();
    newest.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"v2");

    setup.engine.shutdown().await;
}

#[tokio::test]
async fn engine_survives_a_restart_with_a_warm_cache() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::with_root(dir.path());
    config.debounce_delay_ms = 50;

    let (space_id, file_id);
    {
        let engine = SpaceEngine::builder(config.clone()).build().await.unwrap();
        let space = engine
            .tree()
            .provision_space(
                &SpaceType::Personal {
                    username: "marie".into(),
                },
                "Marie",
            )
            .await
            .unwrap();
        let file = engine
            .tree()
            .touch_file(&Reference::from(space.resource_id()), "kept.txt")
            .await
            .unwrap();
        space_id = space.space_id().clone();
        file_id = file.id().clone();
        engine.shutdown().await;
    }

    let engine = SpaceEngine::builder(config).build().await.unwrap();
    let node = engine
        .lookup()
        .node_from_id(&space_id, &file_id)
        .await
        .unwrap();
    assert_eq!(node.name(), "kept.txt");

    // Personal space ids stay stable across restarts.
    let same_space = engine
        .tree()
        .provision_space(
            &SpaceType::Personal {
                username: "marie".into(),
            },
            "Marie",
        )
        .await
        .unwrap();
    assert_eq!(same_space.space_id(), &space_id);

    engine.shutdown().await;
}
