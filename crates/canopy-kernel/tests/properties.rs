//! Persistent properties through the workspace.
//!
//! Properties live in SQLite keyed by resource path. These tests cover how
//! structural operations and batches affect what a reader sees.

use std::sync::Arc;

use canopy_kernel::markers::BOOKMARK;
use canopy_kernel::properties::MAX_VALUE_LEN;
use canopy_kernel::{
    MarkerAttributes, QualifiedName, ResourceKind, ResourcePath, SchedulingRule, UpdateFlags,
    Workspace, WorkspaceConfig, WorkspaceError,
};
use tempfile::TempDir;

// ============================================================================
// Shared test setup
// ============================================================================

fn p(s: &str) -> ResourcePath {
    ResourcePath::parse(s).unwrap()
}

const NONE: UpdateFlags = UpdateFlags::empty();

fn owner() -> QualifiedName {
    QualifiedName::new("org.example", "owner")
}

async fn workspace() -> Arc<Workspace> {
    let ws = Workspace::in_memory().unwrap();
    ws.create(&p("/P"), ResourceKind::Project, NONE).await.unwrap();
    ws.create_file(&p("/P/a/x.txt"), b"", UpdateFlags::FORCE)
        .await
        .unwrap();
    ws
}

// ============================================================================
// Reads and writes
// ============================================================================

#[tokio::test]
async fn test_missing_resource_is_an_error() {
    let ws = workspace().await;
    assert!(matches!(
        ws.get_property(&p("/P/nope"), &owner()),
        Err(WorkspaceError::ResourceNotFound(_))
    ));
    assert!(matches!(
        ws.set_property(&p("/P/nope"), &owner(), Some("me")).await,
        Err(WorkspaceError::ResourceNotFound(_))
    ));
}

#[tokio::test]
async fn test_values_come_back_exactly() {
    let ws = workspace().await;
    let values = [
        "",
        "  padded  ",
        "line one\nline two",
        "ünïcødé ✓",
        "quote ' and \" and ; DROP TABLE properties;",
    ];
    for value in values {
        ws.set_property(&p("/P/a/x.txt"), &owner(), Some(value))
            .await
            .unwrap();
        assert_eq!(
            ws.get_property(&p("/P/a/x.txt"), &owner()).unwrap().as_deref(),
            Some(value)
        );
    }

    let longest = "é".repeat(MAX_VALUE_LEN);
    ws.set_property(&p("/P"), &owner(), Some(&longest)).await.unwrap();
    assert_eq!(ws.get_property(&p("/P"), &owner()).unwrap(), Some(longest));
}

#[tokio::test]
async fn test_unset_removes_the_value() {
    let ws = workspace().await;
    let other = QualifiedName::new("org.example", "reviewer");
    ws.set_property(&p("/P"), &owner(), Some("me")).await.unwrap();
    ws.set_property(&p("/P"), &other, Some("you")).await.unwrap();

    ws.set_property(&p("/P"), &owner(), None).await.unwrap();
    assert_eq!(ws.get_property(&p("/P"), &owner()).unwrap(), None);
    assert_eq!(ws.properties(&p("/P")).unwrap(), vec![(other, "you".to_string())]);
}

#[tokio::test]
async fn test_rejected_values() {
    let ws = workspace().await;
    let too_long = "x".repeat(MAX_VALUE_LEN + 1);
    assert!(matches!(
        ws.set_property(&p("/P"), &owner(), Some(&too_long)).await,
        Err(WorkspaceError::InvalidValue { .. })
    ));
    assert!(matches!(
        ws.set_property(&p("/P"), &QualifiedName::new("org.example", ""), Some("v"))
            .await,
        Err(WorkspaceError::InvalidValue { .. })
    ));
    assert_eq!(ws.get_property(&p("/P"), &owner()).unwrap(), None);
}

// ============================================================================
// Structural operations
// ============================================================================

#[tokio::test]
async fn test_move_drops_persistent_properties() {
    let ws = workspace().await;
    ws.set_property(&p("/P/a/x.txt"), &owner(), Some("me"))
        .await
        .unwrap();
    let marker = ws
        .create_marker(&p("/P/a/x.txt"), BOOKMARK, MarkerAttributes::new())
        .await
        .unwrap();

    ws.move_resource(&p("/P/a"), &p("/P/b"), NONE).await.unwrap();

    // markers travel with the resource, properties do not
    assert_eq!(ws.find_marker(marker).unwrap().path, p("/P/b/x.txt"));
    assert_eq!(ws.get_property(&p("/P/b/x.txt"), &owner()).unwrap(), None);
}

#[tokio::test]
async fn test_delete_removes_subtree_properties() {
    let ws = workspace().await;
    ws.set_property(&p("/P/a"), &owner(), Some("dir")).await.unwrap();
    ws.set_property(&p("/P/a/x.txt"), &owner(), Some("file"))
        .await
        .unwrap();
    ws.set_property(&p("/P"), &owner(), Some("project")).await.unwrap();

    ws.delete(&p("/P/a"), NONE).await.unwrap();
    ws.create_file(&p("/P/a/x.txt"), b"", UpdateFlags::FORCE)
        .await
        .unwrap();

    assert_eq!(ws.get_property(&p("/P/a"), &owner()).unwrap(), None);
    assert_eq!(ws.get_property(&p("/P/a/x.txt"), &owner()).unwrap(), None);
    assert_eq!(
        ws.get_property(&p("/P"), &owner()).unwrap().as_deref(),
        Some("project")
    );
}

#[tokio::test]
async fn test_copy_does_not_carry_properties() {
    let ws = workspace().await;
    ws.set_property(&p("/P/a/x.txt"), &owner(), Some("me"))
        .await
        .unwrap();
    ws.copy(&p("/P/a"), &p("/P/c"), NONE).await.unwrap();
    assert_eq!(ws.get_property(&p("/P/c/x.txt"), &owner()).unwrap(), None);
    assert_eq!(
        ws.get_property(&p("/P/a/x.txt"), &owner()).unwrap().as_deref(),
        Some("me")
    );
}

// ============================================================================
// Batches
// ============================================================================

#[tokio::test]
async fn test_batch_writes_visible_inside_until_commit() {
    let ws = workspace().await;
    let mut op = ws.begin(SchedulingRule::new(p("/P"))).await.unwrap();
    op.set_property(&p("/P/a"), &owner(), Some("pending"))
        .await
        .unwrap();

    assert_eq!(
        op.get_property(&p("/P/a"), &owner()).unwrap().as_deref(),
        Some("pending")
    );
    assert_eq!(ws.get_property(&p("/P/a"), &owner()).unwrap(), None);

    // a later delete in the same batch hides it again
    op.delete(&p("/P/a"), NONE).await.unwrap();
    op.create(&p("/P/a"), ResourceKind::Folder, NONE).await.unwrap();
    assert_eq!(op.get_property(&p("/P/a"), &owner()).unwrap(), None);
    op.set_property(&p("/P/a"), &owner(), Some("again"))
        .await
        .unwrap();

    op.commit().await.unwrap();
    assert_eq!(
        ws.get_property(&p("/P/a"), &owner()).unwrap().as_deref(),
        Some("again")
    );
}

#[tokio::test]
async fn test_aborted_batch_writes_nothing() {
    let ws = workspace().await;
    let mut op = ws.begin(SchedulingRule::new(p("/P"))).await.unwrap();
    op.set_property(&p("/P"), &owner(), Some("lost")).await.unwrap();
    op.abort().await;
    assert_eq!(ws.get_property(&p("/P"), &owner()).unwrap(), None);
}

#[tokio::test]
async fn test_failed_step_discards_its_property_edits() {
    let ws = workspace().await;
    ws.set_property(&p("/P/a/x.txt"), &owner(), Some("kept"))
        .await
        .unwrap();
    ws.file_store()
        .remove(std::path::Path::new("/P/a/x.txt"))
        .await
        .unwrap();

    let mut op = ws.begin(SchedulingRule::new(p("/P"))).await.unwrap();
    // out of sync: the step fails and is undone, including its property removal
    assert!(op.delete(&p("/P/a/x.txt"), NONE).await.is_err());
    op.commit().await.unwrap();
    assert_eq!(
        ws.get_property(&p("/P/a/x.txt"), &owner()).unwrap().as_deref(),
        Some("kept")
    );
}

// ============================================================================
// Durability
// ============================================================================

#[tokio::test]
async fn test_properties_survive_reopening() {
    let dir = TempDir::new().unwrap();
    let config = WorkspaceConfig {
        properties_db: Some(dir.path().join("properties.db")),
        ..WorkspaceConfig::default()
    };

    {
        let ws = Workspace::builder(config.clone()).build().unwrap();
        ws.create(&p("/P"), ResourceKind::Project, NONE).await.unwrap();
        ws.set_property(&p("/P"), &owner(), Some("me")).await.unwrap();
    }

    let ws = Workspace::builder(config).build().unwrap();
    ws.create(&p("/P"), ResourceKind::Project, NONE).await.unwrap();
    assert_eq!(
        ws.get_property(&p("/P"), &owner()).unwrap().as_deref(),
        Some("me")
    );
}
