use camino::Utf8PathBuf;

use kira_biodata_repository::catalog::Catalog;
use kira_biodata_repository::domain::{FileFormat, RevisionEncoding};
use kira_biodata_repository::revisions::{IngestOutcome, Repository, StorageOptions};
use kira_biodata_repository::store::Store;

fn store(temp: &tempfile::TempDir) -> Store {
    Store::new_with_root(Utf8PathBuf::from_path_buf(temp.path().join("repo")).unwrap())
}

#[test]
fn catalog_and_blobs_land_in_the_layout() {
    let temp = tempfile::tempdir().unwrap();
    let repo = Repository::open(store(&temp), StorageOptions::default()).unwrap();
    let dataset = repo
        .edit(|catalog| catalog.add_dataset("layout", ""))
        .unwrap();
    let IngestOutcome::NewRevision(revision) = repo
        .ingest(dataset, "genes.tsv", b"id\tname\n", None, FileFormat::Simple)
        .unwrap()
    else {
        panic!("expected a new revision");
    };
    assert_eq!(revision.encoding, RevisionEncoding::Snapshot);

    let blob = repo.store().blob_path(dataset, revision.file, 1);
    assert!(repo.store().exists(&blob));
    assert_eq!(repo.store().read_blob(&blob).unwrap(), b"id\tname\n");

    let on_disk: Catalog = Store::read_json(&repo.store().catalog_path())
        .unwrap()
        .unwrap();
    let file = on_disk.file(revision.file).unwrap();
    assert_eq!(file.name, "genes.tsv");
    assert_eq!(file.default_format, FileFormat::Simple);
    assert_eq!(on_disk.updates().len(), 1);
}

#[test]
fn atomic_write_replaces_content() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("nested/out.txt")).unwrap();
    Store::write_bytes_atomic(&path, b"first").unwrap();
    Store::write_bytes_atomic(&path, b"second").unwrap();
    assert_eq!(std::fs::read(path.as_std_path()).unwrap(), b"second");
}

#[test]
fn fresh_repository_writes_an_empty_catalog() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);
    let catalog_path = store.catalog_path();
    let repo = Repository::open(store, StorageOptions::default()).unwrap();
    assert!(repo.store().exists(&catalog_path));
    assert!(repo.catalog().datasets().is_empty());
}
