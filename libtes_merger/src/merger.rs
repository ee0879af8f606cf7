use fxhash::FxHashSet;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::calibration::{CalibrationState, ChannelFailure};
use super::channel::{Channel, ChannelGroup};
use super::error::{ChannelError, MergeError};
use super::experiment_state::{format_unixnano, StateSelection};

const NANOSECONDS_PER_SECOND: f64 = 1.0e9;

/// The time-ordered events of all surviving channels.
///
/// Stored as three parallel arrays. Timestamps are seconds since the unix epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedEvents {
    pub timestamps: Vec<f64>,
    pub energies: Vec<f64>,
    pub channels: Vec<u32>,
}

impl MergedEvents {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(capacity),
            energies: Vec::with_capacity(capacity),
            channels: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, timestamp: f64, energy: f64, channel: u32) {
        self.timestamps.push(timestamp);
        self.energies.push(energy);
        self.channels.push(channel);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Sorted, de-duplicated list of the channels that contributed events
    pub fn channel_set(&self) -> Vec<u32> {
        let set: FxHashSet<u32> = self.channels.iter().copied().collect();
        let mut channels: Vec<u32> = set.into_iter().collect();
        channels.sort_unstable();
        channels
    }
}

/// The merged events along with the channels that were dropped while merging
#[derive(Debug)]
pub struct MergeOutcome {
    pub events: MergedEvents,
    pub failures: Vec<ChannelFailure>,
}

/// The events of one channel, sorted by time
#[derive(Debug)]
struct ChannelEvents {
    channel: u32,
    unixnano: Vec<u64>,
    energies: Vec<f64>,
}

/// Heap entry pointing at the next unmerged event of one channel
#[derive(Debug, PartialEq, Eq)]
struct Cursor {
    unixnano: u64,
    stream: usize,
    position: usize,
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so that the BinaryHeap pops the earliest event first. Equal times go to the
        // stream that comes first in channel order.
        other
            .unixnano
            .cmp(&self.unixnano)
            .then_with(|| other.stream.cmp(&self.stream))
            .then_with(|| other.position.cmp(&self.position))
    }
}

/// Merge the calibrated events recorded under `state_label` from every good channel.
///
/// Channels that are not covered by the calibration, or whose data cannot be read, are
/// marked bad and reported in the outcome; they stay bad for every later merge of the group.
pub fn merge_events(
    calibration: &CalibrationState,
    channels: &mut ChannelGroup,
    state_label: &str,
) -> Result<MergeOutcome, MergeError> {
    let selection = channels.states().selection(state_label)?;

    let mut streams: Vec<ChannelEvents> = Vec::new();
    let mut failures: Vec<ChannelFailure> = Vec::new();
    for channel in channels.iter_mut() {
        if channel.is_bad() {
            continue;
        }
        match read_channel_events(calibration, channel, &selection) {
            Ok(events) => streams.push(events),
            Err(e) => {
                spdlog::warn!("Channel {} dropped from merge: {}", channel.number(), e);
                let reason = e.to_string();
                channel.mark_bad(&reason);
                failures.push(ChannelFailure {
                    channel: channel.number(),
                    reason,
                });
            }
        }
    }

    if streams.is_empty() {
        return Err(MergeError::NoSurvivingChannels(state_label.to_string()));
    }

    let events = k_way_merge(&streams);
    if let (Some(first), Some(last)) = (
        streams.iter().filter_map(|s| s.unixnano.first()).min(),
        streams.iter().filter_map(|s| s.unixnano.last()).max(),
    ) {
        spdlog::info!(
            "Merged {} events from {} channels between {} and {}",
            events.len(),
            streams.len(),
            format_unixnano(*first),
            format_unixnano(*last)
        );
    } else {
        spdlog::info!(
            "No events recorded under state {} in {} channels",
            state_label,
            streams.len()
        );
    }

    Ok(MergeOutcome { events, failures })
}

fn read_channel_events(
    calibration: &CalibrationState,
    channel: &Channel,
    selection: &StateSelection,
) -> Result<ChannelEvents, ChannelError> {
    let number = channel.number();
    let cal = calibration
        .get(number)
        .ok_or(ChannelError::NotCalibrated(number))?;
    let events = cal.read_events(channel, selection)?;
    let energies = cal.energies(&events)?;
    let unixnano = events.unixnano();

    // Stable, so events with equal timestamps keep their arrival order
    let mut order: Vec<usize> = (0..unixnano.len()).collect();
    order.sort_by_key(|idx| unixnano[*idx]);
    Ok(ChannelEvents {
        channel: number,
        unixnano: order.iter().map(|idx| unixnano[*idx]).collect(),
        energies: order.iter().map(|idx| energies[*idx]).collect(),
    })
}

fn k_way_merge(streams: &[ChannelEvents]) -> MergedEvents {
    let total = streams.iter().map(|s| s.unixnano.len()).sum();
    let mut merged = MergedEvents::with_capacity(total);
    let mut heap: BinaryHeap<Cursor> = streams
        .iter()
        .enumerate()
        .filter_map(|(stream, events)| {
            events.unixnano.first().map(|unixnano| Cursor {
                unixnano: *unixnano,
                stream,
                position: 0,
            })
        })
        .collect();

    while let Some(cursor) = heap.pop() {
        let events = &streams[cursor.stream];
        merged.push(
            cursor.unixnano as f64 / NANOSECONDS_PER_SECOND,
            events.energies[cursor.position],
            events.channel,
        );
        let next = cursor.position + 1;
        if let Some(unixnano) = events.unixnano.get(next) {
            heap.push(Cursor {
                unixnano: *unixnano,
                stream: cursor.stream,
                position: next,
            });
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::build_calibration;
    use crate::channel::ChannelGroup;
    use crate::testing::{
        aligned_group, line_names, standard_states, synthetic_channel, synthetic_group,
        GrowingChannel, CAL_STATE, N_CAL_EVENTS, N_SCAN_EVENTS, SCAN_STATE,
    };
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn calibrate(group: &mut ChannelGroup) -> CalibrationState {
        build_calibration(group, "cal-run", CAL_STATE, &line_names(), None)
            .unwrap()
            .state
    }

    fn assert_sorted(events: &MergedEvents) {
        assert_eq!(events.timestamps.len(), events.energies.len());
        assert_eq!(events.timestamps.len(), events.channels.len());
        assert!(events.timestamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_k_way_merge_ties() {
        let streams = vec![
            ChannelEvents {
                channel: 1,
                unixnano: vec![5, 10, 10, 30],
                energies: vec![1.0, 2.0, 3.0, 4.0],
            },
            ChannelEvents {
                channel: 4,
                unixnano: vec![10, 20],
                energies: vec![5.0, 6.0],
            },
            ChannelEvents {
                channel: 7,
                unixnano: vec![],
                energies: vec![],
            },
        ];
        let merged = k_way_merge(&streams);
        assert_eq!(merged.channels, vec![1, 1, 1, 4, 4, 1]);
        assert_eq!(merged.energies, vec![1.0, 2.0, 3.0, 5.0, 6.0, 4.0]);
        assert_eq!(merged.timestamps[0], 5.0e-9);
    }

    #[test]
    fn test_merge_interleaves_channels() {
        let mut group = synthetic_group(&[1, 2, 3], &[]);
        let cal = calibrate(&mut group);
        let outcome = merge_events(&cal, &mut group, SCAN_STATE).unwrap();

        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.events.len(), 3 * N_SCAN_EVENTS);
        assert_eq!(outcome.events.channel_set(), vec![1, 2, 3]);
        assert_sorted(&outcome.events);
        // Channel offsets interleave the streams event by event
        assert_eq!(&outcome.events.channels[..6], &[1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_duplicate_timestamps_follow_channel_order() {
        let mut group = aligned_group(&[2, 5, 9]);
        let cal = calibrate(&mut group);
        let first = merge_events(&cal, &mut group, SCAN_STATE).unwrap().events;
        assert_sorted(&first);
        for chunk in first.channels.chunks(3) {
            assert_eq!(chunk, &[2, 5, 9]);
        }
        for chunk in first.timestamps.chunks(3) {
            assert_eq!(chunk[0], chunk[2]);
        }

        let second = merge_events(&cal, &mut group, SCAN_STATE).unwrap().events;
        assert_eq!(first, second);
    }

    #[test]
    fn test_failed_channel_stays_excluded() {
        let switch = Arc::new(AtomicBool::new(false));
        let channels = vec![
            Channel::new(Box::new(synthetic_channel(1, 0))),
            Channel::new(Box::new(synthetic_channel(2, 0).with_switch(switch.clone()))),
            Channel::new(Box::new(synthetic_channel(3, 0))),
        ];
        let mut group = ChannelGroup::from_parts(channels, standard_states());
        let cal = calibrate(&mut group);
        assert_eq!(cal.channel_numbers(), vec![1, 2, 3]);

        switch.store(true, AtomicOrdering::SeqCst);
        let outcome = merge_events(&cal, &mut group, SCAN_STATE).unwrap();
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].channel, 2);
        assert_eq!(outcome.events.channel_set(), vec![1, 3]);

        // Even once the channel reads again it is not merged
        switch.store(false, AtomicOrdering::SeqCst);
        let outcome = merge_events(&cal, &mut group, SCAN_STATE).unwrap();
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.events.channel_set(), vec![1, 3]);
        assert!(group.get(2).unwrap().is_bad());
    }

    #[test]
    fn test_channel_still_being_written_stays_good() {
        let total = N_CAL_EVENTS + N_SCAN_EVENTS;
        let channels = vec![
            Channel::new(Box::new(GrowingChannel::new(
                synthetic_channel(1, 0),
                total - 100,
            ))),
            Channel::new(Box::new(synthetic_channel(2, 0))),
        ];
        let mut group = ChannelGroup::from_parts(channels, standard_states());
        let cal = calibrate(&mut group);
        assert_eq!(cal.channel_numbers(), vec![1, 2]);

        let first = merge_events(&cal, &mut group, SCAN_STATE).unwrap();
        assert!(first.failures.is_empty());
        assert_eq!(first.events.channel_set(), vec![1, 2]);
        assert_sorted(&first.events);

        let second = merge_events(&cal, &mut group, SCAN_STATE).unwrap();
        assert!(second.failures.is_empty());
        assert_eq!(second.events.len(), first.events.len() + 1);
        assert_eq!(group.good_channels(), vec![1, 2]);
    }

    #[test]
    fn test_uncalibrated_channel_is_dropped() {
        let mut cal_group = synthetic_group(&[1], &[]);
        let cal = calibrate(&mut cal_group);

        let mut group = synthetic_group(&[1, 6], &[]);
        let outcome = merge_events(&cal, &mut group, SCAN_STATE).unwrap();
        assert_eq!(outcome.events.channel_set(), vec![1]);
        assert!(matches!(
            outcome.failures.as_slice(),
            [ChannelFailure { channel: 6, .. }]
        ));
    }

    #[test]
    fn test_no_surviving_channels() {
        let mut group = synthetic_group(&[1, 2], &[]);
        let cal = calibrate(&mut group);
        for channel in group.iter_mut() {
            channel.mark_bad("test");
        }
        assert!(matches!(
            merge_events(&cal, &mut group, SCAN_STATE),
            Err(MergeError::NoSurvivingChannels(_))
        ));
    }

    #[test]
    fn test_unknown_state_is_run_level() {
        let mut group = synthetic_group(&[1, 2], &[]);
        let cal = calibrate(&mut group);
        assert!(matches!(
            merge_events(&cal, &mut group, "SCAN9"),
            Err(MergeError::StateError(_))
        ));
        assert_eq!(group.good_channels(), vec![1, 2]);
    }
}
