use memory_regions::MemoryRegions;
use resilient_storage::{ResilientConfig, ResilientState};
use storage_device::{RamStorage, Result, SharedStorage, StorageError};

use crate::*;

type Ram = RamStorage<32768>;

const REGIONS: MemoryRegions = MemoryRegions::FRAM_32K;

fn config() -> ResilientConfig {
    ResilientConfig::new().with_backoff(4, 2, 8)
}

fn event(n: u8) -> [u8; EVENT_ENTRY_SIZE as usize] {
    [n; EVENT_ENTRY_SIZE as usize]
}

fn message(n: u8) -> [u8; MESSAGE_ENTRY_SIZE as usize] {
    [n; MESSAGE_ENTRY_SIZE as usize]
}

#[test]
fn first_boot_formats_logs() {
    let mut status = InitStatus::empty();
    let storage = init_storage(Ram::new(), Ram::new(), config(), &mut status);
    let mut store = init_store(&storage, &REGIONS, &mut status);

    assert_eq!(
        status,
        InitStatus::EVENT_LOG_FORMATTED | InitStatus::MESSAGE_LOG_FORMATTED
    );
    assert_eq!(store.state(), ResilientState::Primary);
    assert_eq!(store.events().capacity(), 508);
    assert_eq!(store.messages().capacity(), 182);
    assert!(store.events().config().overwrite_on_full);
    assert!(!store.messages().config().overwrite_on_full);
    assert!(store.events().is_empty());
}

#[test]
fn reboot_restores_logs_and_config() {
    let mut status = InitStatus::empty();
    let storage = init_storage(Ram::new(), Ram::new(), config(), &mut status);
    let mut store = init_store(&storage, &REGIONS, &mut status);
    store.store_config(b"freq=868").unwrap();
    for n in 0..3 {
        store.events().write(&event(n)).unwrap();
    }
    store.messages().write(&message(0x42)).unwrap();
    drop(store);
    let (primary, fallback) = storage.into_inner().release();

    let mut status = InitStatus::empty();
    let storage = init_storage(primary, fallback, config(), &mut status);
    let mut store = init_store(&storage, &REGIONS, &mut status);
    assert!(status.is_empty());

    assert_eq!(store.events().len(), 3);
    let mut buf = event(0xff);
    store.events().read(&mut buf).unwrap();
    assert_eq!(buf, event(0));
    assert_eq!(store.messages().len(), 1);

    let mut blob = [0u8; 8];
    store.load_config(&mut blob).unwrap();
    assert_eq!(&blob, b"freq=868");
}

#[test]
fn missing_primary_runs_on_fallback() {
    let mut primary = Ram::new();
    primary.set_offline(true);
    let mut status = InitStatus::empty();
    let storage = init_storage(primary, Ram::new(), config(), &mut status);
    let mut store = init_store(&storage, &REGIONS, &mut status);

    assert!(status.contains(InitStatus::PRIMARY_ERROR));
    assert!(!status.contains(InitStatus::FALLBACK_ERROR));
    assert!(!status.contains(InitStatus::STORAGE_FAILED));
    assert_eq!(store.state(), ResilientState::Fallback);

    for n in 0..10 {
        store.events().write(&event(n)).unwrap();
    }
    let mut buf = event(0xff);
    store.events().read_at(9, &mut buf).unwrap();
    assert_eq!(buf, event(9));
    // failed probes keep the store on the fallback
    assert_eq!(store.state(), ResilientState::Fallback);
    assert!(store.stats().recovery_attempts > 0);
    assert_eq!(store.stats().recoveries, 0);
}

#[test]
fn no_usable_device() {
    let mut primary = Ram::new();
    primary.set_offline(true);
    let mut fallback = Ram::new();
    fallback.set_offline(true);
    let mut status = InitStatus::empty();
    let storage = init_storage(primary, fallback, config(), &mut status);
    let mut store = init_store(&storage, &REGIONS, &mut status);

    assert!(status.contains(
        InitStatus::PRIMARY_ERROR | InitStatus::FALLBACK_ERROR | InitStatus::STORAGE_FAILED
    ));
    assert_eq!(store.state(), ResilientState::Failed);
    assert_eq!(
        store.events().write(&event(1)),
        Err(StorageError::NotInitialized)
    );
    assert_eq!(
        store.store_config(b"x"),
        Err(StorageError::NotInitialized)
    );
}

#[test]
fn config_blob_is_crc_checked() {
    let mut status = InitStatus::empty();
    let storage = init_storage(Ram::new(), Ram::new(), config(), &mut status);
    let mut store = init_store(&storage, &REGIONS, &mut status);
    store.store_config(b"node-7").unwrap();

    storage.lock(|s| s.primary_mut().as_bytes_mut()[2] ^= 0x10);
    let mut blob = [0u8; 6];
    assert_eq!(store.load_config(&mut blob), Err(StorageError::CrcMismatch));
    assert_eq!(blob, [0u8; 6]);

    store.store_config(b"node-7").unwrap();
    store.load_config(&mut blob).unwrap();
    assert_eq!(&blob, b"node-7");
}

#[test]
fn config_size_limits() {
    let mut status = InitStatus::empty();
    let storage = init_storage(Ram::new(), Ram::new(), config(), &mut status);
    let mut store = init_store(&storage, &REGIONS, &mut status);

    assert_eq!(store.store_config(&[]), Err(StorageError::InvalidSize));
    assert_eq!(store.store_config(&[0; 255]), Err(StorageError::InvalidSize));
    assert_eq!(store.store_config(&[0; 254]), Ok(()));
    assert_eq!(store.load_config(&mut []), Err(StorageError::InvalidSize));
}

#[test]
fn events_overwrite_messages_fill_up() {
    let mut status = InitStatus::empty();
    let storage = init_storage(Ram::new(), Ram::new(), config(), &mut status);
    let mut store = init_store(&storage, &REGIONS, &mut status);

    for n in 0..510u16 {
        store.events().write(&event(n as u8)).unwrap();
    }
    assert_eq!(store.events().len(), 508);
    let mut buf = event(0xff);
    store.events().peek(&mut buf).unwrap();
    assert_eq!(buf, event(2));

    for n in 0..182u16 {
        store.messages().write(&message(n as u8)).unwrap();
    }
    assert_eq!(
        store.messages().write(&message(0)),
        Err(StorageError::BufferFull)
    );
}

#[test]
fn whole_operations_under_one_lock() {
    let mut status = InitStatus::empty();
    let storage = init_storage(Ram::new(), Ram::new(), config(), &mut status);
    let store = init_store(&storage, &REGIONS, &mut status);
    let shared = SharedStorage::new(store);

    shared
        .lock(|store| -> Result<()> {
            store.events().write(&event(7))?;
            store.store_config(b"sf=9")
        })
        .unwrap();
    assert_eq!(shared.lock(|store| store.events().len()), 1);
}

#[test]
fn resync_after_recovery() {
    let mut status = InitStatus::empty();
    let storage = init_storage(Ram::new(), Ram::new(), config(), &mut status);
    let mut store = init_store(&storage, &REGIONS, &mut status);
    store.store_config(b"v1").unwrap();

    storage.lock(|s| s.primary_mut().fail_next(3));
    assert_eq!(store.store_config(b"v2"), Err(StorageError::Bus));
    assert_eq!(store.store_config(b"v2"), Err(StorageError::Bus));
    assert_eq!(store.store_config(b"v2"), Ok(()));
    assert_eq!(store.state(), ResilientState::Fallback);
    assert_eq!(store.stats().failovers, 1);

    // payload and header commit: two fallback operations
    store.events().write(&event(5)).unwrap();
    let mut blob = [0u8; 2];
    store.load_config(&mut blob).unwrap();
    assert_eq!(&blob, b"v2");

    // the fourth operation probes the primary and is served by it
    store.load_config(&mut blob).unwrap();
    assert_eq!(store.state(), ResilientState::Primary);
    assert_eq!(store.stats().recoveries, 1);
    assert_eq!(&blob, b"v1");

    store.resync().unwrap();
    store.load_config(&mut blob).unwrap();
    assert_eq!(&blob, b"v2");
    assert_eq!(store.events().len(), 1);
    let mut buf = event(0xff);
    store.events().read(&mut buf).unwrap();
    assert_eq!(buf, event(5));
    assert!(store.messages().is_empty());
}

#[test]
fn resync_keeps_data_written_before_failover() {
    let mut status = InitStatus::empty();
    let storage = init_storage(Ram::new(), Ram::new(), config(), &mut status);
    let mut store = init_store(&storage, &REGIONS, &mut status);
    store.store_config(b"v1").unwrap();
    for n in 0..3 {
        store.events().write(&event(n)).unwrap();
    }
    store.messages().write(&message(0x40)).unwrap();
    store.messages().write(&message(0x41)).unwrap();

    storage.lock(|s| s.primary_mut().fail_next(3));
    for _ in 0..3 {
        let _ = store.store_config(b"v2");
    }
    assert_eq!(store.state(), ResilientState::Fallback);
    store.events().write(&event(9)).unwrap();

    let mut blob = [0u8; 2];
    while store.state() != ResilientState::Primary {
        store.load_config(&mut blob).unwrap();
    }
    store.resync().unwrap();
    assert!(storage.lock(|s| s.unsynced().is_empty()));

    store.load_config(&mut blob).unwrap();
    assert_eq!(&blob, b"v2");
    assert_eq!(store.events().len(), 4);
    let mut buf = event(0xff);
    for (i, n) in [0, 1, 2, 9].iter().enumerate() {
        store.events().read_at(i, &mut buf).unwrap();
        assert_eq!(buf, event(*n));
    }
    assert_eq!(store.messages().len(), 2);
    let mut buf = message(0xff);
    store.messages().read_at(1, &mut buf).unwrap();
    assert_eq!(buf, message(0x41));
}
