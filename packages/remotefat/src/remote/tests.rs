use super::{
    job::{Batch, Job},
    sim::SimulatedRemote,
    RemoteBlockDevice, RemoteConfig,
};
use crate::{
    block::BlockDevice,
    error::{Error, TransportError},
    SECTOR_SIZE,
};

fn patterned_image(sectors: usize) -> Vec<u8> {
    let mut image = vec![0u8; sectors * SECTOR_SIZE];
    for (sector, chunk) in image.chunks_mut(SECTOR_SIZE).enumerate() {
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = (sector as u8).wrapping_mul(31).wrapping_add(i as u8);
        }
    }
    image
}

fn device(sectors: usize, config: RemoteConfig) -> RemoteBlockDevice<SimulatedRemote> {
    RemoteBlockDevice::new(SimulatedRemote::new(patterned_image(sectors)), config)
}

fn small_staging() -> RemoteConfig {
    RemoteConfig {
        staging_sectors: 4,
        ..RemoteConfig::default()
    }
}

#[test]
fn multi_sector_read_is_split_by_staging_size() {
    let mut dev = device(32, small_staging());
    let sectors = dev.read_sectors(3, 10).unwrap();
    let expected = patterned_image(32);

    assert_eq!(sectors.len(), 10);
    for (offset, sector) in sectors.iter().enumerate() {
        let at = (3 + offset) * SECTOR_SIZE;
        assert_eq!(&sector[..], &expected[at..at + SECTOR_SIZE]);
    }
    assert_eq!(dev.transport_mut().batches_run, 3);
    assert_eq!(dev.transport_mut().sectors_read, (3..13).collect::<Vec<_>>());
}

#[test]
fn writes_reach_the_card_and_repeats_are_merged() {
    let mut dev = device(16, RemoteConfig::default());
    let first = [0x11u8; SECTOR_SIZE];
    let second = [0x22u8; SECTOR_SIZE];
    let other = [0x33u8; SECTOR_SIZE];

    dev.write_sectors(&[(5, first), (9, other), (5, second)])
        .unwrap();

    let sim = dev.transport_mut();
    assert_eq!(sim.sectors_written, vec![5, 9]);
    assert_eq!(&sim.image[5 * SECTOR_SIZE..6 * SECTOR_SIZE], &second[..]);
    assert_eq!(&sim.image[9 * SECTOR_SIZE..10 * SECTOR_SIZE], &other[..]);
}

#[test]
fn beacons_mid_batch_do_not_disturb_completion() {
    let mut dev = device(8, RemoteConfig::default());
    dev.transport_mut().beacon_every = 1;
    dev.transport_mut().chunk = 3;

    let sector = dev.read_sector(2).unwrap();
    assert_eq!(sector[0], 2u8.wrapping_mul(31));
    assert!(dev.handshake_state().beacons_seen >= 2);
    assert_eq!(dev.handshake_state().version.as_deref(), Some("0"));
}

#[test]
fn silent_remote_times_out() {
    let mut dev = device(
        8,
        RemoteConfig {
            batch_retries: 0,
            ..RemoteConfig::default()
        },
    );
    dev.transport_mut().silent = true;

    let err = dev.read_sector(0).unwrap_err();
    assert!(matches!(
        err,
        Error::Transport(TransportError::Timeout { .. })
    ));
}

#[test]
fn lost_response_is_recovered_by_replay() {
    let mut dev = device(8, RemoteConfig::default());
    dev.transport_mut().drop_responses = 1;

    let sector = dev.read_sector(4).unwrap();
    assert_eq!(sector[1], 4u8.wrapping_mul(31).wrapping_add(1));
    assert_eq!(dev.stats().retries, 1);
    assert_eq!(dev.transport_mut().batches_run, 2);
}

#[test]
fn retries_are_bounded() {
    let mut dev = device(8, RemoteConfig::default());
    dev.transport_mut().drop_responses = 10;

    assert!(dev.read_sector(1).is_err());
    assert_eq!(dev.transport_mut().batches_run, 3);
}

#[test]
fn abort_mid_batch_names_first_unexecuted_job() {
    let mut dev = device(8, RemoteConfig::default());
    let mut batch = Batch::new();
    for sector in 0..3 {
        batch.push(Job::ReadSector {
            buffer: 0x40000 + sector * SECTOR_SIZE as u32,
            sector,
        });
    }
    batch.push(Job::Raw {
        opcode: 0x42,
        payload: Vec::new(),
    });
    batch.push(Job::ReadSector {
        buffer: 0x40000,
        sector: 4,
    });
    let batch = batch.finish();

    let err = dev.execute(&batch).unwrap_err();
    match err {
        TransportError::JobsNotExecuted {
            first_unexecuted,
            job_count,
        } => {
            assert_eq!(first_unexecuted, 3);
            assert_eq!(job_count, 6);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(dev.transport_mut().sectors_read, vec![0, 1, 2]);
}

#[test]
fn aborted_write_batch_is_detected_through_the_sentinel() {
    let mut dev = device(
        8,
        RemoteConfig {
            batch_retries: 0,
            ..RemoteConfig::default()
        },
    );
    dev.transport_mut().abort_next_at = Some(1);

    let err = dev
        .write_sectors(&[(1, [1u8; SECTOR_SIZE]), (2, [2u8; SECTOR_SIZE])])
        .unwrap_err();
    // Job 0 ran, but only the sentinel could have vouched for it.
    assert!(matches!(
        err,
        Error::Transport(TransportError::JobsNotExecuted {
            first_unexecuted: 0,
            job_count: 3,
        })
    ));
    assert_eq!(dev.transport_mut().sectors_written, vec![1]);
}

#[test]
fn aborted_write_batch_is_replayed_whole() {
    let mut dev = device(8, RemoteConfig::default());
    dev.transport_mut().abort_next_at = Some(1);

    dev.write_sectors(&[(1, [1u8; SECTOR_SIZE]), (2, [2u8; SECTOR_SIZE])])
        .unwrap();
    let sim = dev.transport_mut();
    assert_eq!(sim.sectors_written, vec![1, 1, 2]);
    assert_eq!(sim.image[2 * SECTOR_SIZE], 2);
}

#[test]
fn malformed_notice_does_not_wedge_the_link() {
    let mut dev = device(8, RemoteConfig::default());
    dev.transport_mut().inject(b"ftjobdone:zz01:\n\r");

    let sector = dev.read_sector(1).unwrap();
    assert_eq!(sector[0], 31);
    assert_eq!(dev.stats().retries, 1);
}

#[test]
fn truncated_payload_is_abandoned_before_the_replay() {
    let mut dev = device(8, RemoteConfig::default());
    dev.transport_mut().inject(b"ftjobdata:c001:00000200:\x01\x02");

    let sector = dev.read_sector(3).unwrap();
    assert_eq!(sector[0], 3u8.wrapping_mul(31));
    assert_eq!(dev.stats().retries, 1);
    assert_eq!(dev.transport_mut().resyncs, 1);

    let next = dev.read_sector(4).unwrap();
    assert_eq!(next[0], 4u8.wrapping_mul(31));
    assert_eq!(dev.stats().retries, 1);
}

#[test]
fn payload_larger_than_requested_is_refused() {
    let mut dev = device(8, RemoteConfig::default());
    dev.transport_mut().inject(b"ftjobdata:c001:ffffffff:");

    let sector = dev.read_sector(2).unwrap();
    assert_eq!(sector[0], 2u8.wrapping_mul(31));
    assert_eq!(dev.stats().retries, 1);
}

#[test]
fn notice_for_foreign_job_is_rejected() {
    let mut dev = device(8, RemoteConfig::default());
    dev.transport_mut().inject(b"ftjobdone:cabc:\n\r");
    let batch = Batch::new().finish();

    assert!(matches!(
        dev.execute(&batch),
        Err(TransportError::UnexpectedNotice(_))
    ));
}

#[test]
fn handshake_reports_beacon_version() {
    let mut dev = device(8, RemoteConfig::default());
    dev.transport_mut().inject(b"junk\r\n");
    dev.transport_mut().emit_beacon();

    assert_eq!(dev.handshake().unwrap(), "0");
    assert_eq!(dev.handshake_state().beacons_seen, 1);
}

#[test]
fn handshake_without_beacon_fails() {
    let mut dev = device(8, RemoteConfig::default());
    assert!(matches!(dev.handshake(), Err(TransportError::NoBeacon)));
}

#[test]
fn terminate_sends_quit_job() {
    let mut dev = device(8, RemoteConfig::default());
    dev.terminate().unwrap();
    assert!(dev.transport_mut().terminated);
}
