//! Shared data region tests: segment allocation, client slots and data
//! visibility between writer and reader attachments.

use astro_shared_memory::{DataSharedRead, DataSharedWrite, SharedRegion, ShmError, ShmResult};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[test]
fn two_segments_serve_two_channels_then_refuse() -> ShmResult<()> {
    let mut writer = DataSharedWrite::create(2, 1024)?;

    let first = writer.add_client(1024, 0, 5)?;
    assert!(first == 0 || first == 1);
    let second = writer.add_client(1024, 1, 5)?;
    assert_ne!(first, second);

    match writer.add_client(1024, 2, 6) {
        Err(ShmError::NoFreeSegment { chan: 2 }) => {}
        other => panic!("expected NoFreeSegment, got {other:?}"),
    }
    Ok(())
}

#[test]
fn removed_client_frees_segment() -> ShmResult<()> {
    let mut writer = DataSharedWrite::create(1, 256)?;
    let seg = writer.add_client(256, 0, 3)?;
    assert!(writer.add_client(256, 1, 4).is_err());

    writer.remove_client(seg, 3)?;
    assert_eq!(writer.add_client(128, 1, 4)?, seg);
    assert_eq!(writer.channel_size(1)?, 128);
    Ok(())
}

#[test]
fn removing_absent_client_fails_and_keeps_slots() -> ShmResult<()> {
    let mut writer = DataSharedWrite::create(1, 64)?;
    let seg = writer.add_client(64, 0, 11)?;

    assert!(matches!(
        writer.remove_client(seg, 12),
        Err(ShmError::ClientNotFound { client: 12, .. })
    ));

    let reader = DataSharedRead::attach(writer.shm_id())?;
    reader.confirm_client(seg, 11)?;
    Ok(())
}

#[test]
fn invalid_client_ids_rejected() -> ShmResult<()> {
    let mut writer = DataSharedWrite::create(1, 64)?;
    assert!(matches!(
        writer.add_client(64, 0, 0),
        Err(ShmError::InvalidClient { client: 0 })
    ));
    assert!(matches!(
        writer.remove_client(0, -1),
        Err(ShmError::InvalidClient { client: -1 })
    ));
    Ok(())
}

#[test]
fn reader_sees_writer_progress() -> ShmResult<()> {
    let mut writer = DataSharedWrite::create(2, 32)?;
    let seg = writer.add_client(10, 0, 21)?;

    let reader = DataSharedRead::attach(writer.shm_id())?;
    assert_eq!(reader.nseg(), 2);
    let channel = reader.channel(seg)?;
    assert_eq!(channel.rest_size()?, 10);

    writer.write_channel(0, b"abcd")?;
    assert_eq!(channel.bytes_so_far()?, 4);
    assert_eq!(channel.data()?, b"abcd");
    assert_eq!(writer.data_size()?, 6);

    assert!(matches!(
        writer.write_channel(0, &[0u8; 7]),
        Err(ShmError::SegmentOverflow { remaining: 6, .. })
    ));

    writer.end_channels()?;
    assert_eq!(channel.rest_size()?, 0);

    channel.remove_active_client(21)?;
    assert!(reader.confirm_client(seg, 21).is_err());
    Ok(())
}

#[test]
fn progress_updates_do_not_clobber_client_slots() -> ShmResult<()> {
    let mut writer = DataSharedWrite::create(1, 64)?;
    let seg = writer.add_client(64, 0, 7)?;
    let shm_id = writer.shm_id();
    let done = Arc::new(AtomicBool::new(false));

    let other = {
        let done = Arc::clone(&done);
        thread::spawn(move || -> ShmResult<usize> {
            let result = (|| -> ShmResult<usize> {
                let region = SharedRegion::attach(shm_id)?;
                let mut lost = 0;
                for _ in 0..20_000 {
                    region.update_segment(seg, |record| record.client_ids[1] = 42)?;
                    match region.remove_client(seg, 42) {
                        Ok(()) => {}
                        Err(ShmError::ClientNotFound { .. }) => lost += 1,
                        Err(e) => return Err(e),
                    }
                }
                Ok(lost)
            })();
            done.store(true, Ordering::Release);
            result
        })
    };

    while !done.load(Ordering::Acquire) {
        writer.data_written(0, 0)?;
    }
    let lost = other.join().expect("slot thread panicked")?;
    assert_eq!(lost, 0, "writer progress erased a reader slot");

    let reader = DataSharedRead::attach(shm_id)?;
    reader.confirm_client(seg, 7)?;
    assert!(reader.confirm_client(seg, 42).is_err());
    Ok(())
}

#[test]
fn channel_out_of_range_rejected() -> ShmResult<()> {
    let writer = DataSharedWrite::create(2, 32)?;
    let reader = DataSharedRead::attach(writer.shm_id())?;
    assert!(matches!(
        reader.channel(2),
        Err(ShmError::SegmentOutOfRange { segment: 2, nseg: 2 })
    ));
    Ok(())
}

#[test]
fn zero_geometry_rejected() {
    assert!(matches!(
        DataSharedWrite::create(0, 32),
        Err(ShmError::InvalidGeometry { .. })
    ));
    assert!(matches!(
        DataSharedWrite::create(2, 0),
        Err(ShmError::InvalidGeometry { .. })
    ));
}

#[derive(Debug, Clone)]
enum SlotOp {
    Add(i32),
    Remove(usize, i32),
}

fn slot_op() -> impl Strategy<Value = SlotOp> {
    prop_oneof![
        (1i32..6).prop_map(SlotOp::Add),
        (0usize..3, 1i32..6).prop_map(|(s, c)| SlotOp::Remove(s, c)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A segment is never handed out while a client still holds it, and a
    /// failed removal leaves every slot untouched.
    #[test]
    fn allocation_never_double_books(ops in proptest::collection::vec(slot_op(), 1..40)) {
        let mut writer = DataSharedWrite::create(3, 16).unwrap();
        let reader = DataSharedRead::attach(writer.shm_id()).unwrap();
        let mut holders: [Option<i32>; 3] = [None; 3];

        for (chan, op) in ops.into_iter().enumerate() {
            match op {
                SlotOp::Add(client) => match writer.add_client(16, chan, client) {
                    Ok(seg) => {
                        prop_assert!(holders[seg].is_none());
                        holders[seg] = Some(client);
                    }
                    Err(ShmError::NoFreeSegment { .. }) => {
                        prop_assert!(holders.iter().all(Option::is_some));
                    }
                    Err(e) => prop_assert!(false, "unexpected error {e}"),
                },
                SlotOp::Remove(seg, client) => {
                    let result = writer.remove_client(seg, client);
                    if holders[seg] == Some(client) {
                        prop_assert!(result.is_ok());
                        holders[seg] = None;
                    } else {
                        prop_assert!(result.is_err());
                    }
                }
            }
            for (seg, holder) in holders.iter().enumerate() {
                if let Some(client) = holder {
                    prop_assert!(reader.confirm_client(seg, *client).is_ok());
                }
            }
        }
    }
}
