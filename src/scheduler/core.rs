//! The scheduler engine.
//!
//! # Architecture
//!
//! ```text
//!  caller thread 0            caller thread N
//!  OutputStream ──┐           OutputStream ──┐
//!                 ▼                          ▼
//!        ┌─────────────────────────────────────────┐
//!        │              Scheduler                  │
//!        │  outputs[i]: core mutex + replay + idx  │
//!        │  sched mutex: ready / unscheduled queues│
//!        │  inputs[j]: input mutex + reader        │
//!        └─────────────────────────────────────────┘
//! ```
//!
//! Each output is driven by exactly one thread; the scheduler as a whole is
//! multi-threaded. Lock order, never reversed:
//!
//! 1. own output core (only the owning thread takes it, and only its own)
//! 2. scheduling mutex (dynamic and replay modes only)
//! 3. one input mutex at a time
//!
//! The one exception is marker-driven rescheduling of another thread, which
//! must take the scheduling mutex while processing a record: the input mutex
//! is released first, then scheduling + target input are taken, then the
//! input mutex is re-acquired.
//!
//! # Suspension points
//!
//! The engine never sleeps. It returns `Wait`/`Idle` and the caller retries.
//! Reader `init` and advance may block for streaming sources; both happen
//! under only the owning locks.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use ahash::AHashMap;
use crossbeam_utils::CachePadded;
use log::{debug, info, trace, warn};

use crate::reader::{ReaderFactory, RecordReader};
use crate::record::{MarkerKind, SwitchKind, TraceRecord, VERSION_FREQUENT_TIMESTAMPS};
use crate::scheduler::input::InputState;
use crate::scheduler::options::{DepsMode, MappingMode, QuantumUnit, SchedulerIo, SchedulerOptions};
use crate::scheduler::output::{OutputCore, OutputSlot, SchedStat};
use crate::scheduler::queue::{InputQueue, XorShift64};
use crate::scheduler::replay::{
    instantiate_traced_schedule, read_recorded_schedule, read_traced_schedule,
};
use crate::scheduler::segments::{
    output_component_name, ComponentWrite, ScheduleSegment, SegmentType, SCHEDULE_VERSION_CURRENT,
};
use crate::scheduler::status::{InitError, Status};
use crate::scheduler::stream::OutputStream;
use crate::speculator::{Speculator, SpeculatorKind};
use crate::workload::{InstrRange, TimeRange, WorkloadSource, WorkloadSpec};

/// Skip amounts at or above this sentinel mean "to end of trace" and are not
/// range errors when they run off the end.
const SKIP_TO_END_SENTINEL: u64 = u64::MAX - 2;

pub(crate) struct SchedState {
    pub ready: InputQueue,
    pub unscheduled: InputQueue,
    pub num_blocked: usize,
    pub rng: XorShift64,
}

/// Result of one ROI advancement check.
enum RoiResult {
    Ok,
    Skipped,
    /// The input was already exhausted; the caller must release the input
    /// lock and run the terminal EOF/idle logic.
    EofOrIdle,
    Failed(Status),
}

fn reborrow<'a, T>(opt: &'a mut Option<&mut T>) -> Option<&'a mut T> {
    opt.as_mut().map(|x| &mut **x)
}

pub(crate) struct SchedulerImpl<R: TraceRecord> {
    pub options: SchedulerOptions,
    pub inputs: Vec<Mutex<InputState<R>>>,
    pub outputs: Vec<OutputSlot<R>>,
    pub sched: Mutex<SchedState>,
    pub tid2input: AHashMap<(usize, i64), usize>,
    pub tid2shard: Mutex<AHashMap<i64, usize>>,
    /// Kernel context-switch records to inject, per switch kind.
    pub switch_sequence_thread: Vec<R>,
    pub switch_sequence_process: Vec<R>,
    pub live_input_count: CachePadded<AtomicI64>,
    pub live_replay_output_count: CachePadded<AtomicI64>,
    pub schedule_writer: Mutex<Option<Box<dyn ComponentWrite>>>,
    start: Instant,
}

impl<R: TraceRecord> std::fmt::Debug for SchedulerImpl<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerImpl").finish_non_exhaustive()
    }
}

impl<R: TraceRecord> SchedulerImpl<R> {
    fn now_micros(&self) -> u64 {
        // Monotonic; +1 keeps 0 free as the "unset" sentinel.
        self.start.elapsed().as_micros() as u64 + 1
    }

    fn need_sched_lock(&self) -> bool {
        matches!(
            self.options.mapping,
            MappingMode::ToAnyOutput | MappingMode::AsPreviously
        )
    }

    fn lock_sched(&self) -> MutexGuard<'_, SchedState> {
        self.sched.lock().expect("sched lock poisoned")
    }

    fn input(&self, idx: usize) -> MutexGuard<'_, InputState<R>> {
        self.inputs[idx].lock().expect("input lock poisoned")
    }

    fn recording(&self) -> bool {
        self.schedule_writer
            .lock()
            .expect("writer lock poisoned")
            .is_some()
    }

    fn mark_input_eof(&self, input: &mut InputState<R>) {
        if input.at_eof {
            return;
        }
        input.at_eof = true;
        let left = self.live_input_count.fetch_add(-1, Ordering::AcqRel) - 1;
        debug_assert!(left >= 0);
        debug!("input {} at eof; {} live inputs left", input.index, left);
    }

    fn scale_blocked_time(&self, latency_us: u64) -> u64 {
        let mut scaled_us = (latency_us as f64 * self.options.block_time_multiplier) as u64;
        if scaled_us > self.options.block_time_max_us {
            // A cap keeps outlier latencies from stalling the simulation for
            // wall-clock minutes once every other input has finished.
            scaled_us = self.options.block_time_max_us;
        }
        (scaled_us as f64 * self.options.time_units_per_us) as u64
    }

    // -----------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------

    fn add_to_unscheduled_queue(&self, sched: &mut SchedState, input: &InputState<R>) {
        debug_assert!(input.unscheduled && input.blocked_time == 0);
        trace!(
            "unscheduled queue (pre-size {}): adding input {} priority {}",
            sched.unscheduled.len(),
            input.index,
            input.priority
        );
        sched
            .unscheduled
            .push(input.index, input.priority, input.queue_timestamp_delta());
    }

    fn add_to_ready_queue(&self, sched: &mut SchedState, input: &InputState<R>) {
        if input.unscheduled && input.blocked_time == 0 {
            self.add_to_unscheduled_queue(sched, input);
            return;
        }
        trace!(
            "ready queue (pre-size {}): adding input {} priority {} block time {}",
            sched.ready.len(),
            input.index,
            input.priority,
            input.blocked_time
        );
        if input.blocked_time > 0 {
            sched.num_blocked += 1;
        }
        sched
            .ready
            .push(input.index, input.priority, input.queue_timestamp_delta());
    }

    /// Pops the best eligible input for `for_output`.
    ///
    /// Entries bound to other outputs are re-inserted with their counters
    /// intact (their FIFO position is preserved); still-blocked entries move
    /// to the back. `Ok(None)` means the queue was empty; `Err(Idle)` means
    /// everything runnable is blocked on modeled i/o.
    fn pop_from_ready_queue(
        &self,
        sched: &mut SchedState,
        for_output: usize,
        cur_time: u64,
    ) -> Result<Option<usize>, Status> {
        let mut skipped = Vec::new();
        let mut blocked = Vec::new();
        let mut chosen = None;
        while let Some(entry) = if self.options.randomize_next_input {
            sched.ready.pop_random(&mut sched.rng)
        } else {
            sched.ready.pop_first()
        } {
            let mut input = self.input(entry.input);
            debug_assert!(!input.unscheduled || input.blocked_time > 0);
            if input.binding_allows(for_output) {
                if input.blocked_time > 0 {
                    debug_assert!(cur_time > 0);
                    sched.num_blocked -= 1;
                    if cur_time.saturating_sub(input.blocked_start_time) < input.blocked_time {
                        trace!(
                            "pop queue: input {} still blocked for {}",
                            input.index,
                            input.blocked_time - (cur_time - input.blocked_start_time)
                        );
                        // No interrupts exist to wake it; keep it queued and
                        // keep searching.
                        blocked.push(entry);
                        continue;
                    }
                }
                input.blocked_time = 0;
                input.unscheduled = false;
                chosen = Some(entry.input);
                break;
            } else {
                drop(input);
                skipped.push(entry);
            }
        }
        let had_blocked = !blocked.is_empty();
        for entry in skipped {
            sched.ready.reinsert(entry);
        }
        for entry in blocked {
            // Back of the queue, fresh counter.
            sched.num_blocked += 1;
            sched
                .ready
                .push(entry.input, entry.priority, entry.timestamp_delta);
        }
        if chosen.is_none() && had_blocked {
            // Not EOF: inputs are still blocked on modeled i/o.
            return Err(Status::Idle);
        }
        Ok(chosen)
    }

    // -----------------------------------------------------------------
    // Schedule recording
    // -----------------------------------------------------------------

    fn record_schedule_segment(
        &self,
        core: &mut OutputCore<R>,
        seg_type: SegmentType,
        key: u64,
        value: u64,
        stop: u64,
    ) {
        let timestamp = self.now_micros();
        if seg_type == SegmentType::Idle
            && core
                .record
                .last()
                .is_some_and(|s| s.seg_type == SegmentType::Idle)
        {
            // Consecutive idles merge; intermediate timestamps carry no
            // information and the records balloon the file.
            return;
        }
        trace!("recording segment type={seg_type:?} key={key} start={value} stop={stop}");
        core.record
            .push(ScheduleSegment::new(seg_type, key, value, stop, timestamp));
    }

    /// Stamps the stop instruction (or idle duration) on the open segment.
    fn close_schedule_segment(&self, core: &mut OutputCore<R>, input: Option<&InputState<R>>) {
        let now = self.now_micros();
        let Some(last) = core.record.last_mut() else {
            debug_assert!(false, "no segment to close");
            return;
        };
        match last.seg_type {
            SegmentType::Skip => {
                // Skips are recorded with their final stop value.
            }
            SegmentType::Idle => {
                debug_assert!(now >= last.timestamp);
                last.value = now - last.timestamp;
            }
            _ => {
                let Some(input) = input else {
                    debug_assert!(false, "closing an input segment without its input");
                    return;
                };
                let mut instr_ord = input.instr_ordinal();
                if input.at_eof || input.reader_exhausted() {
                    // Exclusive end: run to the end of the input.
                    instr_ord = u64::MAX;
                } else if input.switching_pre_instruction {
                    // The candidate instruction was read but not delivered;
                    // +1 keeps the stop ordinal exclusive.
                    instr_ord += 1;
                }
                trace!(
                    "close segment: input={} start={} stop={}",
                    input.index,
                    last.value,
                    instr_ord
                );
                last.stop_instruction = instr_ord;
            }
        }
    }

    fn record_schedule_skip(
        &self,
        core: &mut OutputCore<R>,
        input: &InputState<R>,
        start_instruction: u64,
        stop_instruction: u64,
    ) {
        // Close any open span of this input first.
        if core
            .record
            .last()
            .is_some_and(|s| s.seg_type == SegmentType::Default && s.key == input.index as u64)
        {
            self.close_schedule_segment(core, Some(input));
        }
        if core.record.len() == 1 {
            // Replay can't start with a skip: insert a 0,0 dummy span right
            // after the version record to get the read loop going.
            debug_assert!(core.record[0].seg_type == SegmentType::Version);
            self.record_schedule_segment(core, SegmentType::Default, input.index as u64, 0, 0);
        }
        self.record_schedule_segment(
            core,
            SegmentType::Skip,
            input.index as u64,
            start_instruction,
            stop_instruction,
        );
        self.record_schedule_segment(
            core,
            SegmentType::Default,
            input.index as u64,
            stop_instruction,
            0,
        );
    }

    // -----------------------------------------------------------------
    // Input assignment
    // -----------------------------------------------------------------

    /// Installs `new_input` (or parks the output with `None`), returning the
    /// previous input to the ready queue and keeping the schedule recording
    /// consistent. Caller holds the sched lock in modes that need it and no
    /// input locks.
    fn set_cur_input(
        &self,
        out: usize,
        core: &mut OutputCore<R>,
        new_input: Option<usize>,
        mut sched: Option<&mut SchedState>,
    ) {
        let recording = self.recording();
        let prev = core.cur_input;
        if let Some(prev_idx) = prev {
            let prev_state = self.input(prev_idx);
            if self.options.mapping == MappingMode::ToAnyOutput
                && prev != new_input
                && !prev_state.at_eof
            {
                let sched_state = reborrow(&mut sched).expect("dynamic mode requires sched lock");
                self.add_to_ready_queue(sched_state, &prev_state);
            }
            if prev != new_input && recording {
                self.close_schedule_segment(core, Some(&prev_state));
            }
        } else if recording
            && core
                .record
                .last()
                .is_some_and(|s| s.seg_type == SegmentType::Idle)
        {
            self.close_schedule_segment(core, None);
        }
        if core.cur_input.is_some() {
            core.prev_input = core.cur_input;
        }
        core.cur_input = new_input;
        let Some(new_idx) = new_input else {
            return;
        };
        if prev == new_input {
            return;
        }

        let prev_workload = match core.prev_input {
            Some(pi) if Some(pi) != new_input => Some(self.input(pi).workload),
            _ => None,
        };

        let mut input = self.input(new_idx);
        if let Some(prev_out) = input.prev_output {
            if prev_out != out {
                debug!(
                    "output[{out}] migrating input {} from output {prev_out}",
                    input.index
                );
                core.stats.bump(SchedStat::Migrations);
            }
        }
        input.prev_output = Some(out);

        if input.pid != 0 {
            // Re-inject context headers for schemas that need them, ahead of
            // anything already queued.
            let headers = R::switch_context_records(input.tid, input.pid);
            for record in headers.into_iter().rev() {
                input.queue.push_front(record);
            }
        }

        let have_sequences =
            !self.switch_sequence_thread.is_empty() || !self.switch_sequence_process.is_empty();
        if have_sequences && core.delivered_instrs > 0 {
            let kind = if prev_workload.is_some() && prev_workload == Some(input.workload) {
                SwitchKind::Thread
            } else {
                SwitchKind::Process
            };
            let sequence = match kind {
                SwitchKind::Thread => &self.switch_sequence_thread,
                SwitchKind::Process => &self.switch_sequence_process,
            };
            if !sequence.is_empty() {
                // The kernel acts on behalf of the incoming input, so its
                // records go on that input's queue, ahead of prior items and
                // retagged to the incoming tid. These will appear before a
                // new thread's own headers; odd, but kept for compatibility.
                for record in sequence.iter().rev() {
                    let mut record = record.clone();
                    record.set_tid(input.tid);
                    input.queue.push_front(record);
                }
                debug!(
                    "injected {} switch records ({kind:?}) into input {}",
                    sequence.len(),
                    input.index
                );
            }
        }

        input.prev_time_in_quantum = core.cur_time;

        if recording {
            let instr_ord = input.instr_ordinal();
            let init_skip_target = input
                .regions_of_interest
                .first()
                .map(|r| r.start_instruction)
                .filter(|_| input.cur_region == 0 && input.in_cur_region)
                .filter(|&start| instr_ord == start || instr_ord + 1 == start);
            if let Some(start) = init_skip_target {
                // The init-time ROI skip had no output to record against;
                // record it now.
                self.record_schedule_skip(core, &input, 0, start);
            } else {
                self.record_schedule_segment(
                    core,
                    SegmentType::Default,
                    input.index as u64,
                    instr_ord,
                    0,
                );
            }
        }
    }

    // -----------------------------------------------------------------
    // Replay dispatch
    // -----------------------------------------------------------------

    /// Advances the replayed segment list for `out`. On success the chosen
    /// input is in the second tuple slot; non-`Ok` statuses may still carry
    /// an input that must be installed (skips, synthetic ends).
    fn pick_next_input_as_previously(
        &self,
        out: usize,
        core: &mut OutputCore<R>,
        sched: &mut Option<&mut SchedState>,
    ) -> (Result<(), Status>, Option<usize>) {
        let slot = &self.outputs[out];
        let ri = slot.record_index.load(Ordering::Acquire);
        let next = (ri + 1) as usize;
        if next >= slot.replay.len() {
            if !core.at_eof {
                core.at_eof = true;
                self.live_replay_output_count.fetch_add(-1, Ordering::AcqRel);
            }
            let prev = core.cur_input;
            let status = self.eof_or_idle(out, core, reborrow(sched), prev);
            return (Err(status), None);
        }
        let segment = slot.replay[next];
        if segment.seg_type == SegmentType::Idle {
            core.waiting = true;
            core.wait_start_time = core.cur_time;
            slot.record_index.store(next as i64, Ordering::Release);
            return (Err(Status::Idle), None);
        }
        let index = segment.key as usize;
        trace!(
            "replay[{out}]: next segment input={index} type={:?} start={} stop={}",
            segment.seg_type,
            segment.value,
            segment.stop_instruction
        );
        {
            let input = self.input(index);
            let instr_ord = input.instr_ordinal();
            if instr_ord > segment.value {
                warn!(
                    "replay[{out}]: input {index} wants instr #{} but is already at #{instr_ord}",
                    segment.value
                );
            }
            let prior_is_skip = ri >= 0
                && slot
                    .replay
                    .get(ri as usize)
                    .is_some_and(|s| s.seg_type == SegmentType::Skip);
            if instr_ord < segment.value
                // An ROI that starts at the beginning needs no wait.
                && segment.value > 1
                // The output may have begun in the wait state; otherwise,
                // after a skip our separator markers sit at the prior
                // ordinal (don't wait on that), and at the end only the
                // exit record is needed.
                && (ri == -1
                    || (!prior_is_skip && segment.seg_type != SegmentType::SyntheticEnd))
            {
                // Another output still owns this input and has not advanced
                // far enough; a single input supports one position only.
                debug!(
                    "replay[{out}]: waiting for input {index} instr #{}",
                    segment.value
                );
                drop(input);
                self.set_cur_input(out, core, None, reborrow(sched));
                core.waiting = true;
                return (Err(Status::Wait), None);
            }
        }
        if self.options.deps == DepsMode::Timestamps {
            for (i, other) in self.outputs.iter().enumerate() {
                if i == out {
                    continue;
                }
                let other_next = (other.record_index.load(Ordering::Acquire) + 1) as usize;
                if other_next < other.replay.len()
                    && segment.timestamp > other.replay[other_next].timestamp
                {
                    debug!(
                        "replay[{out}]: timestamp {} is ahead of output {i}, waiting",
                        segment.timestamp
                    );
                    self.set_cur_input(out, core, None, reborrow(sched));
                    core.waiting = true;
                    return (Err(Status::Wait), None);
                }
            }
        }
        match segment.seg_type {
            SegmentType::SyntheticEnd => {
                let mut input = self.input(index);
                // Past the final region of interest: replace any queued
                // candidate with a synthetic exit.
                input.clear_queue();
                let exit = R::thread_exit(input.tid);
                input.queue.push_back(exit);
                self.mark_input_eof(&mut input);
                debug!("replay[{out}]: early end for input {index}");
                // The queued exit still needs to be read, so stay on this
                // entry.
                slot.record_index.store(next as i64, Ordering::Release);
                (Err(Status::Skipped), Some(index))
            }
            SegmentType::Skip => {
                let mut input = self.input(index);
                let cur_reader_instr = input.reader.instruction_ordinal();
                debug!(
                    "replay[{out}]: skipping input {index} from {cur_reader_instr} to {}",
                    segment.stop_instruction
                );
                let status = self.skip_instructions(
                    &mut input,
                    segment.stop_instruction.saturating_sub(cur_reader_instr + 1),
                );
                // Count the region so window markers carry ordinals.
                input.cur_region += 1;
                if status != Status::Skipped {
                    return (Err(Status::Invalid), None);
                }
                // Done with the skip: move to and past it.
                slot.record_index.store(next as i64 + 1, Ordering::Release);
                (Err(Status::Skipped), Some(index))
            }
            _ => {
                trace!(
                    "replay[{out}]: advancing to input {index} instr #{}",
                    segment.value
                );
                slot.record_index.store(next as i64, Ordering::Release);
                (Ok(()), Some(index))
            }
        }
    }

    // -----------------------------------------------------------------
    // Dispatcher
    // -----------------------------------------------------------------

    /// Picks and installs the next input for `out`.
    ///
    /// `blocked_time` is nonzero when the outgoing input just hit a
    /// blocking syscall and must sit out that long.
    fn pick_next_input(
        &self,
        out: usize,
        core: &mut OutputCore<R>,
        blocked_time: u64,
    ) -> Result<(), Status> {
        let mut res: Result<(), Status> = Ok(());
        let mut guard = if self.need_sched_lock() {
            Some(self.lock_sched())
        } else {
            None
        };
        let mut sched: Option<&mut SchedState> = guard.as_deref_mut();
        let prev_index = core.cur_input;
        let mut index: Option<usize> = None;
        loop {
            if index.is_none() {
                match self.options.mapping {
                    MappingMode::AsPreviously => {
                        let (status, picked) =
                            self.pick_next_input_as_previously(out, core, &mut sched);
                        match status {
                            Ok(()) => index = picked,
                            Err(Status::Skipped) => {
                                index = picked;
                                res = Err(Status::Skipped);
                                break;
                            }
                            Err(other) => return Err(other),
                        }
                    }
                    MappingMode::ToAnyOutput => {
                        let sched_state =
                            reborrow(&mut sched).expect("dynamic mode requires sched lock");
                        if blocked_time > 0 {
                            if let Some(prev) = prev_index {
                                let mut prev_state = self.input(prev);
                                if prev_state.blocked_time == 0 {
                                    debug!("next_record[{out}]: blocked time {blocked_time}");
                                    prev_state.blocked_time = blocked_time;
                                    prev_state.blocked_start_time = core.cur_time;
                                }
                            }
                        }
                        let switch_target = match prev_index {
                            Some(prev) => {
                                let mut prev_state = self.input(prev);
                                prev_state.switch_to_input.take()
                            }
                            None => None,
                        };
                        if let Some(target_idx) = switch_target {
                            let mut target = self.input(target_idx);
                            if sched_state.ready.contains(target_idx) {
                                debug!(
                                    "next_record[{out}]: direct switch from input {:?} to input {target_idx}",
                                    prev_index
                                );
                                sched_state.ready.erase(target_idx);
                                index = Some(target_idx);
                                if target.blocked_time > 0 {
                                    sched_state.num_blocked -= 1;
                                    target.blocked_time = 0;
                                    target.unscheduled = false;
                                }
                                if target.prev_output.is_some_and(|o| o != out) {
                                    core.stats.bump(SchedStat::Migrations);
                                }
                                core.stats.bump(SchedStat::DirectSwitchSuccesses);
                            } else if sched_state.unscheduled.contains(target_idx) {
                                target.unscheduled = false;
                                sched_state.unscheduled.erase(target_idx);
                                index = Some(target_idx);
                                debug!(
                                    "next_record[{out}]: direct switch to was-unscheduled input {target_idx}"
                                );
                                if target.prev_output.is_some_and(|o| o != out) {
                                    core.stats.bump(SchedStat::Migrations);
                                }
                                core.stats.bump(SchedStat::DirectSwitchSuccesses);
                            } else {
                                // The target is running elsewhere. Timing
                                // differences between tracing and analysis
                                // can cause this; treat it as a dynamic
                                // switch to whoever is available, and make
                                // sure the missed target does not park
                                // itself forever.
                                info!(
                                    "direct switch target input #{target_idx} is running elsewhere; picking a different target"
                                );
                                target.skip_next_unscheduled = true;
                            }
                        }
                        if index.is_some() {
                            // Direct switch found its target.
                        } else if sched_state.ready.is_empty() && blocked_time == 0 {
                            let Some(prev) = prev_index else {
                                let status =
                                    self.eof_or_idle(out, core, Some(&mut *sched_state), None);
                                return Err(status);
                            };
                            let prev_at_eof = self.input(prev).at_eof;
                            if prev_at_eof {
                                let status = self.eof_or_idle(
                                    out,
                                    core,
                                    Some(&mut *sched_state),
                                    prev_index,
                                );
                                return Err(status);
                            }
                            // Nothing else to run: stay on the prior input.
                            index = Some(prev);
                        } else {
                            // Give up the input first so this output's own
                            // input competes in the queue; FIFO among equal
                            // priorities decides whether we really switch.
                            self.set_cur_input(out, core, None, Some(&mut *sched_state));
                            let popped =
                                self.pop_from_ready_queue(&mut *sched_state, out, core.cur_time);
                            match popped {
                                Ok(Some(next)) => index = Some(next),
                                Ok(None) => {
                                    debug_assert!(blocked_time == 0 || prev_index.is_none());
                                    let status = self.eof_or_idle(
                                        out,
                                        core,
                                        Some(&mut *sched_state),
                                        prev_index,
                                    );
                                    return Err(status);
                                }
                                Err(Status::Idle) => {
                                    core.waiting = true;
                                    if self.recording() {
                                        self.record_schedule_segment(
                                            core,
                                            SegmentType::Idle,
                                            0,
                                            0,
                                            0,
                                        );
                                    }
                                    if prev_index.is_some() {
                                        core.stats.bump(SchedStat::SwitchInputToIdle);
                                    }
                                    return Err(Status::Idle);
                                }
                                Err(other) => return Err(other),
                            }
                        }
                    }
                    _ if self.options.deps == DepsMode::Timestamps => {
                        // Serial timestamp ordering across all live inputs.
                        let mut min_time = u64::MAX;
                        for (i, slot) in self.inputs.iter().enumerate() {
                            let input = slot.lock().expect("input lock poisoned");
                            if !input.at_eof
                                && input.next_timestamp > 0
                                && input.next_timestamp < min_time
                            {
                                min_time = input.next_timestamp;
                                index = Some(i);
                            }
                        }
                        let Some(picked) = index else {
                            let status = self.eof_or_idle(out, core, reborrow(&mut sched), prev_index);
                            return Err(status);
                        };
                        trace!(
                            "next_record[{out}]: advancing to timestamp {min_time} == input #{picked}"
                        );
                    }
                    MappingMode::ToConsistentOutput => {
                        // The static assignment was made at init; walk it.
                        core.assigned_cursor += 1;
                        if core.assigned_cursor >= core.assigned_inputs.len() {
                            trace!("next_record[{out}]: all assigned inputs at eof");
                            return Err(Status::Eof);
                        }
                        index = Some(core.assigned_inputs[core.assigned_cursor]);
                    }
                    _ => return Err(Status::Invalid),
                }
                if let Some(idx) = index {
                    let mut input = self.input(idx);
                    if input.ensure_init().is_err() {
                        return Err(Status::Invalid);
                    }
                }
            }
            let idx = index.expect("an input must have been chosen");
            {
                let mut input = self.input(idx);
                if input.at_eof || input.reader_exhausted() {
                    trace!("next_record[{out}]: input #{idx} at eof");
                    if !input.at_eof {
                        self.mark_input_eof(&mut input);
                    }
                    index = None;
                    continue;
                }
            }
            break;
        }
        // Stats cannot live in set_cur_input: it is also used to park.
        if prev_index == index {
            core.stats.bump(SchedStat::SwitchNop);
        } else if prev_index.is_some() && index.is_some() {
            core.stats.bump(SchedStat::SwitchInputToInput);
        } else if index.is_none() {
            core.stats.bump(SchedStat::SwitchInputToIdle);
        } else {
            core.stats.bump(SchedStat::SwitchIdleToInput);
        }
        self.set_cur_input(out, core, index, reborrow(&mut sched));
        res
    }

    /// Terminal logic when the dispatcher finds nothing to run.
    fn eof_or_idle(
        &self,
        out: usize,
        core: &mut OutputCore<R>,
        sched: Option<&mut SchedState>,
        prev_input: Option<usize>,
    ) -> Status {
        if self.options.mapping == MappingMode::ToConsistentOutput
            || self.live_input_count.load(Ordering::Acquire) == 0
            || (self.options.mapping == MappingMode::AsPreviously
                && self.live_replay_output_count.load(Ordering::Acquire) == 0)
        {
            return Status::Eof;
        }
        let mut local_guard: Option<MutexGuard<'_, SchedState>> = None;
        let mut sched: Option<&mut SchedState> = match sched {
            Some(s) => Some(s),
            None if self.need_sched_lock() => {
                local_guard = Some(self.lock_sched());
                local_guard.as_deref_mut()
            }
            None => None,
        };
        if self.options.mapping == MappingMode::ToAnyOutput {
            let sched_state = reborrow(&mut sched).expect("dynamic mode requires sched lock");
            // Unschedule or direct-switch directives can miss their targets
            // (subset runs, timing shifts) leaving only unscheduled inputs.
            // Bound the wait and then flush them back to the ready queue.
            if sched_state.ready.is_empty() && !sched_state.unscheduled.is_empty() {
                if core.wait_start_time == 0 {
                    core.wait_start_time = core.cur_time;
                } else {
                    let elapsed_units = core.cur_time.saturating_sub(core.wait_start_time);
                    let elapsed_us = elapsed_units as f64 / self.options.time_units_per_us;
                    if elapsed_us > self.options.block_time_max_us as f64 {
                        info!("moving entire unscheduled queue to the ready queue");
                        while let Some(entry) = sched_state.unscheduled.pop_first() {
                            {
                                let mut tomove = self.input(entry.input);
                                tomove.unscheduled = false;
                            }
                            sched_state.ready.push(
                                entry.input,
                                entry.priority,
                                entry.timestamp_delta,
                            );
                        }
                        core.wait_start_time = 0;
                    }
                }
            } else {
                core.wait_start_time = 0;
            }
        }
        core.waiting = true;
        if prev_input.is_some() {
            core.stats.bump(SchedStat::SwitchInputToIdle);
        }
        self.set_cur_input(out, core, None, reborrow(&mut sched));
        Status::Idle
    }

    // -----------------------------------------------------------------
    // Regions of interest
    // -----------------------------------------------------------------

    fn skip_instructions(&self, input: &mut InputState<R>, skip_amount: u64) -> Status {
        if input.ensure_init().is_err() {
            return Status::Invalid;
        }
        // A skip of 0 still clears queued non-instrs; an instr in the queue
        // would make the reader's ordinal wrong to skip from.
        debug_assert!(
            skip_amount > 0
                || input
                    .queue
                    .front()
                    .map(|r| !r.is_instr() && !r.is_encoding())
                    .unwrap_or(true)
        );
        input.clear_queue();
        input.reader.skip_instructions(skip_amount);
        debug!("skip_instructions: input={} amount={skip_amount}", input.index);
        if input.instrs_pre_read > 0 {
            // The skip swallowed the pre-read along with everything else.
            input.instrs_pre_read = 0;
        }
        if input.reader_exhausted() {
            self.mark_input_eof(input);
            if skip_amount >= SKIP_TO_END_SENTINEL {
                debug!("skip_instructions: input={} skip to eof", input.index);
                return Status::Skipped;
            }
            debug!("skip_instructions: input={} skip out of bounds", input.index);
            return Status::RegionInvalid;
        }
        input.in_cur_region = true;

        // Let the consumer know records were skipped. The first region has
        // no discontinuity before it, so no marker by default.
        if input.cur_region > 0 || self.options.emit_initial_window_marker {
            input
                .queue
                .push_back(R::window_marker(input.tid, input.cur_region as u64));
        }
        Status::Skipped
    }

    /// Checks the ROI cursor against the input position, skipping ahead or
    /// ending the input as needed. `record` is replaced when a separator
    /// marker must be delivered first.
    fn advance_region_of_interest(
        &self,
        core: Option<&mut OutputCore<R>>,
        record: &mut R,
        input: &mut InputState<R>,
    ) -> RoiResult {
        let cur_instr = input.instr_ordinal();
        let cur_reader_instr = input.reader.instruction_ordinal();
        debug_assert!(input.cur_region < input.regions_of_interest.len());
        let mut cur_range = input.regions_of_interest[input.cur_region];

        if input.in_cur_region
            && cur_range.stop_instruction != 0
            && cur_instr > cur_range.stop_instruction
        {
            input.cur_region += 1;
            input.in_cur_region = false;
            debug!(
                "at {cur_instr} instrs: advancing input {} to ROI #{}",
                input.index, input.cur_region
            );
            if input.cur_region >= input.regions_of_interest.len() {
                if input.at_eof {
                    return RoiResult::EofOrIdle;
                }
                if self.recording() {
                    if let Some(core) = core {
                        self.close_schedule_segment(core, Some(input));
                        // Tells replay to fabricate the thread exit.
                        self.record_schedule_segment(
                            core,
                            SegmentType::SyntheticEnd,
                            input.index as u64,
                            cur_instr,
                            0,
                        );
                    }
                }
                let exit = R::thread_exit(input.tid);
                input.queue.push_back(exit);
                self.mark_input_eof(input);
                return RoiResult::Skipped;
            }
            cur_range = input.regions_of_interest[input.cur_region];
        }

        if !input.in_cur_region && cur_instr >= cur_range.start_instruction {
            // Already there: back-to-back regions. Still announce the new
            // region with a separator.
            input.in_cur_region = true;
            if input.cur_region > 0 || self.options.emit_initial_window_marker {
                input.queue.push_back(record.clone());
                *record = R::window_marker(input.tid, input.cur_region as u64);
            }
            return RoiResult::Ok;
        }
        // Within one instruction and already skipped: the inserted markers
        // sit just before the target, so asking for another skip would make
        // no progress.
        if input.in_cur_region && cur_instr + 1 >= cur_range.start_instruction {
            return RoiResult::Ok;
        }

        debug!(
            "skipping from {cur_instr} to {} instrs ({} in reader) for ROI",
            cur_range.start_instruction,
            cur_range.start_instruction.saturating_sub(cur_reader_instr + 1)
        );
        if self.recording() {
            if let Some(core) = core {
                self.record_schedule_skip(core, input, cur_instr, cur_range.start_instruction);
            }
            // Else: recorded in set_cur_input once assigned to an output.
        }
        if cur_range.start_instruction < cur_reader_instr {
            // Skipping backwards over the pre-read would mean pulling
            // records back out of the queue.
            return RoiResult::Failed(Status::Invalid);
        }
        let amount = cur_range.start_instruction.saturating_sub(cur_reader_instr + 1);
        match self.skip_instructions(input, amount) {
            Status::Skipped => RoiResult::Skipped,
            other => RoiResult::Failed(other),
        }
    }

    // -----------------------------------------------------------------
    // Blocking model
    // -----------------------------------------------------------------

    /// Decides whether the just-finished syscall should block, and for how
    /// long.
    fn syscall_incurs_switch(&self, input: &InputState<R>, blocked_time: &mut u64) -> bool {
        debug_assert!(input.processing_syscall || input.processing_maybe_blocking_syscall);
        let post_time = input.reader.last_timestamp();
        if input.reader.version() < VERSION_FREQUENT_TIMESTAMPS {
            // Legacy trace without timestamps bracketing syscalls: switch on
            // every maybe-blocking syscall with a fixed block interval.
            *blocked_time = self.options.blocking_switch_threshold;
            return input.processing_maybe_blocking_syscall;
        }
        debug_assert!(input.pre_syscall_timestamp > 0);
        debug_assert!(input.pre_syscall_timestamp <= post_time);
        let latency = post_time.saturating_sub(input.pre_syscall_timestamp);
        let threshold = if input.processing_maybe_blocking_syscall {
            self.options.blocking_switch_threshold
        } else {
            self.options.syscall_switch_threshold
        };
        *blocked_time = self.scale_blocked_time(latency);
        debug!(
            "input {} syscall latency {latency} => blocked time {blocked_time}",
            input.index
        );
        latency >= threshold
    }

    // -----------------------------------------------------------------
    // Marker processing
    // -----------------------------------------------------------------

    /// Applies a marker's side effects. Returns the target input of a
    /// resume directive, which the caller must handle after releasing the
    /// input lock (it needs the scheduling mutex).
    fn process_marker(
        &self,
        input: &mut InputState<R>,
        out: usize,
        core: &mut OutputCore<R>,
        kind: MarkerKind,
        value: u64,
    ) -> Option<usize> {
        match kind {
            MarkerKind::Syscall => {
                input.processing_syscall = true;
                input.pre_syscall_timestamp = input.reader.last_timestamp();
            }
            MarkerKind::MaybeBlockingSyscall => {
                input.processing_maybe_blocking_syscall = true;
                // Usually latched by the just-prior syscall marker already,
                // but synthetic sequences may carry only the maybe marker.
                input.pre_syscall_timestamp = input.reader.last_timestamp();
            }
            MarkerKind::ContextSwitchStart => {
                core.in_context_switch_code = true;
                core.in_kernel_code = true;
            }
            MarkerKind::SyscallTraceStart => {
                core.in_kernel_code = true;
            }
            MarkerKind::ContextSwitchEnd => {
                // Clearing waits for the next record so the end marker
                // itself still counts as inside the sequence.
                core.hit_switch_code_end = true;
                core.in_kernel_code = false;
            }
            MarkerKind::SyscallTraceEnd => {
                core.in_kernel_code = false;
            }
            MarkerKind::DirectThreadSwitch => {
                if !self.options.honor_direct_switches {
                    return None;
                }
                core.stats.bump(SchedStat::DirectSwitchAttempts);
                let target_tid = value as i64;
                match self.tid2input.get(&(input.workload, target_tid)) {
                    Some(&target) => input.switch_to_input = Some(target),
                    None => {
                        info!("failed to find input for target switch thread {target_tid}");
                    }
                }
                if input.skip_next_unscheduled {
                    // The modeled kernel mechanism holds a single request;
                    // they do not accumulate.
                    input.skip_next_unscheduled = false;
                    debug!(
                        "input {} unschedule request ignored due to prior schedule request",
                        input.index
                    );
                    return None;
                }
                input.unscheduled = true;
                if input.syscall_timeout_arg > 0 {
                    input.blocked_time = self.scale_blocked_time(input.syscall_timeout_arg);
                    input.blocked_start_time = core.cur_time;
                    debug!("input {} unscheduled for {}", input.index, input.blocked_time);
                } else {
                    debug!("input {} unscheduled indefinitely", input.index);
                }
            }
            MarkerKind::SyscallArgTimeout => {
                // Cleared at the post-syscall instruction.
                input.syscall_timeout_arg = value;
            }
            MarkerKind::SyscallUnschedule => {
                if !self.options.honor_direct_switches {
                    return None;
                }
                if input.skip_next_unscheduled {
                    input.skip_next_unscheduled = false;
                    debug!(
                        "input {} unschedule request ignored due to prior schedule request",
                        input.index
                    );
                    return None;
                }
                input.unscheduled = true;
                if input.syscall_timeout_arg > 0 {
                    input.blocked_time = self.scale_blocked_time(input.syscall_timeout_arg);
                    input.blocked_start_time = core.cur_time;
                    debug!("input {} unscheduled for {}", input.index, input.blocked_time);
                } else {
                    debug!("input {} unscheduled indefinitely", input.index);
                }
            }
            MarkerKind::SyscallSchedule => {
                if !self.options.honor_direct_switches {
                    return None;
                }
                let target_tid = value as i64;
                match self.tid2input.get(&(input.workload, target_tid)) {
                    Some(&target) => {
                        debug!("input {} re-scheduling input {target}", input.index);
                        return Some(target);
                    }
                    None => {
                        info!("failed to find input for resume target tid {target_tid}");
                    }
                }
            }
            _ => {}
        }
        let _ = out;
        None
    }

    /// Deferred half of a resume directive: makes `target` runnable again.
    /// Called with no input locks held; takes sched then target.
    fn reschedule_target(&self, target_idx: usize) {
        let mut guard = if self.need_sched_lock() {
            Some(self.lock_sched())
        } else {
            None
        };
        let sched = guard.as_deref_mut();
        let mut target = self.input(target_idx);
        if target.unscheduled {
            target.unscheduled = false;
            if let Some(sched) = sched {
                if sched.unscheduled.contains(target_idx) {
                    sched.unscheduled.erase(target_idx);
                    self.add_to_ready_queue(sched, &target);
                } else if sched.ready.contains(target_idx) {
                    // Any tracked block interval came from a timeout
                    // argument, not real i/o; the resume erases it.
                    if target.blocked_time > 0 {
                        debug!("resume erasing blocked time for target input {target_idx}");
                        sched.num_blocked -= 1;
                        target.blocked_time = 0;
                    }
                }
            }
        } else {
            debug!("input {target_idx} will skip next unschedule");
            target.skip_next_unscheduled = true;
        }
    }

    // -----------------------------------------------------------------
    // The streaming iterator
    // -----------------------------------------------------------------

    pub(crate) fn next_record(&self, out: usize, cur_time: u64) -> Result<R, Status> {
        let slot = &self.outputs[out];
        let mut core_guard = slot.core.lock().expect("output core poisoned");
        let core = &mut *core_guard;
        let cur_time = if cur_time == 0 {
            self.now_micros()
        } else {
            cur_time
        };
        core.cur_time = cur_time;
        if !slot.active.load(Ordering::Acquire) {
            return Err(Status::Idle);
        }
        if core.waiting {
            if self.options.mapping == MappingMode::AsPreviously {
                let ri = slot.record_index.load(Ordering::Acquire);
                let idle_duration = slot
                    .replay
                    .get(ri.max(0) as usize)
                    .filter(|s| ri >= 0 && s.seg_type == SegmentType::Idle)
                    .map(|s| s.value);
                if let Some(duration) = idle_duration {
                    if core.wait_start_time == 0 {
                        core.wait_start_time = core.cur_time;
                        return Err(Status::Idle);
                    }
                    if core.cur_time.saturating_sub(core.wait_start_time) < duration {
                        trace!(
                            "next_record[{out}]: idle elapsed {} < duration {duration}",
                            core.cur_time - core.wait_start_time
                        );
                        return Err(Status::Wait);
                    }
                    core.wait_start_time = 0;
                }
            }
            trace!("next_record[{out}]: need new input (cur=waiting)");
            match self.pick_next_input(out, core, 0) {
                Ok(()) | Err(Status::Skipped) => {}
                Err(other) => return Err(other),
            }
            core.waiting = false;
        }
        let Some(mut input_idx) = core.cur_input else {
            // More outputs than inputs; non-empty outputs had an input
            // installed during init.
            return Err(self.eof_or_idle(out, core, None, None));
        };
        let mut input = self.input(input_idx);
        // No start time is passed in, so stamp each input's first record.
        if input.prev_time_in_quantum == 0 {
            input.prev_time_in_quantum = cur_time;
        }
        if !core.speculation_stack.is_empty() {
            core.prev_speculate_pc = core.speculate_pc;
            let mut pc = core.speculate_pc;
            let result = core.speculator.next_record(&mut pc, input.tid);
            core.speculate_pc = pc;
            return match result {
                Ok(record) => {
                    // Input and ordinals stay put; no switches and no
                    // quantum accounting while speculating.
                    Ok(record)
                }
                Err(err) => {
                    warn!("next_record[{out}]: speculation failed: {err}");
                    Err(Status::Invalid)
                }
            };
        }
        let mut record: R;
        loop {
            input.cur_from_queue = false;
            if input.ensure_init().is_err() {
                return Err(Status::Invalid);
            }
            if let Some(queued) = input.queue.pop_front() {
                record = queued;
                input.cur_from_queue = true;
            } else {
                // The reader sits on its first record after init and on the
                // landing record after a skip; advance only past consumed
                // records.
                if input.needs_advance && !input.at_eof {
                    input.reader.advance();
                } else {
                    input.needs_advance = true;
                }
                if input.at_eof || input.reader_exhausted() {
                    if !input.at_eof {
                        self.mark_input_eof(&mut input);
                    }
                    drop(input);
                    trace!("next_record[{out}]: need new input (cur={input_idx} eof)");
                    let res = self.pick_next_input(out, core, 0);
                    match res {
                        Ok(()) | Err(Status::Skipped) => {}
                        Err(other) => return Err(other),
                    }
                    input_idx = core.cur_input.ok_or(Status::Invalid)?;
                    input = self.input(input_idx);
                    if res == Err(Status::Skipped) {
                        // The queued record (or a re-deref) must be read
                        // without an advance.
                        input.needs_advance = false;
                    }
                    continue;
                }
                record = input.reader.current();
            }
            if input.instrs_pre_read > 0 && record.is_instr() {
                input.instrs_pre_read -= 1;
            }

            let mut need_new_input = false;
            let mut preempt = false;
            let mut blocked_time = 0u64;
            let mut prev_time_in_quantum = 0u64;

            match self.options.mapping {
                MappingMode::AsPreviously => {
                    let ri = slot.record_index.load(Ordering::Acquire);
                    debug_assert!(ri >= 0);
                    let ri = ri as usize;
                    if ri >= slot.replay.len() {
                        trace!("next_record[{out}]: on last replay record");
                    } else {
                        match slot.replay[ri].seg_type {
                            SegmentType::Skip => {
                                need_new_input = true;
                            }
                            SegmentType::SyntheticEnd => {
                                trace!("next_record[{out}]: at synthetic end");
                            }
                            _ => {
                                let segment = &slot.replay[ri];
                                let start = segment.value;
                                let stop = segment.stop_instruction;
                                // The stop is exclusive. A 0,0 span is the
                                // starter dummy ahead of an initial skip;
                                // everything else only ends once the queue
                                // is drained.
                                if input.instr_ordinal() >= stop
                                    && (!input.cur_from_queue || (start == 0 && stop == 0))
                                {
                                    trace!(
                                        "next_record[{out}]: end of segment in={input_idx} stop={stop}"
                                    );
                                    need_new_input = true;
                                }
                            }
                        }
                    }
                }
                MappingMode::ToAnyOutput => {
                    // Most traces pair a syscall marker with any
                    // maybe-blocking marker, but synthetic streams may have
                    // just the maybe, so both flags are checked.
                    if input.processing_syscall || input.processing_maybe_blocking_syscall {
                        // Past all markers tied to the syscall, at the next
                        // instruction boundary, decide the switch.
                        if record.is_instr_boundary(&core.last_record) {
                            if input.switch_to_input.is_some() {
                                // The switch request overrides any latency
                                // threshold.
                                need_new_input = true;
                                debug!(
                                    "next_record[{out}]: direct switch on low-latency syscall in input {input_idx}"
                                );
                            } else if input.blocked_time > 0 {
                                // Another path already decided this input
                                // blocks.
                                need_new_input = true;
                                blocked_time = input.blocked_time;
                                debug!(
                                    "next_record[{out}]: blocked time set for input {input_idx}"
                                );
                            } else if input.unscheduled {
                                need_new_input = true;
                                debug!("next_record[{out}]: input {input_idx} going unscheduled");
                            } else if self.syscall_incurs_switch(&input, &mut blocked_time) {
                                need_new_input = true;
                                debug!(
                                    "next_record[{out}]: hit blocking syscall in input {input_idx}"
                                );
                            }
                            input.processing_syscall = false;
                            input.processing_maybe_blocking_syscall = false;
                            input.pre_syscall_timestamp = 0;
                            input.syscall_timeout_arg = 0;
                        }
                    }
                    if core.hit_switch_code_end {
                        // Delayed so the end marker was still inside the
                        // sequence; now back on the clock.
                        core.in_context_switch_code = false;
                        core.hit_switch_code_end = false;
                        if self.options.quantum_unit == QuantumUnit::Time {
                            input.prev_time_in_quantum = cur_time;
                        }
                    }
                    if let Some((kind, value)) = record.marker() {
                        if let Some(target) = self.process_marker(&mut input, out, core, kind, value)
                        {
                            // Resume directives take the scheduling mutex;
                            // release the input lock first per lock order.
                            drop(input);
                            self.reschedule_target(target);
                            input = self.input(input_idx);
                        }
                    }
                    match self.options.quantum_unit {
                        QuantumUnit::Instructions => {
                            if record.is_instr_boundary(&core.last_record) && !core.in_kernel_code {
                                input.instrs_in_quantum += 1;
                                if input.instrs_in_quantum > self.options.quantum_duration_instrs {
                                    // Prefer a context switch over timestamp
                                    // ordering even if this input remains
                                    // the oldest.
                                    trace!(
                                        "next_record[{out}]: input {input_idx} hit end of instr quantum"
                                    );
                                    preempt = true;
                                    need_new_input = true;
                                    input.instrs_in_quantum = 0;
                                    core.stats.bump(SchedStat::QuantumPreempts);
                                }
                            }
                        }
                        QuantumUnit::Time => {
                            if cur_time == 0 || cur_time < input.prev_time_in_quantum {
                                warn!(
                                    "next_record[{out}]: invalid time {cur_time} vs start {}",
                                    input.prev_time_in_quantum
                                );
                                return Err(Status::Invalid);
                            }
                            input.time_spent_in_quantum += cur_time - input.prev_time_in_quantum;
                            prev_time_in_quantum = input.prev_time_in_quantum;
                            input.prev_time_in_quantum = cur_time;
                            let elapsed_us = input.time_spent_in_quantum as f64
                                / self.options.time_units_per_us;
                            if elapsed_us >= self.options.quantum_duration_us as f64
                                // Switches happen on instruction boundaries
                                // only.
                                && record.is_instr_boundary(&core.last_record)
                            {
                                trace!(
                                    "next_record[{out}]: input {input_idx} hit end of time quantum after {}",
                                    input.time_spent_in_quantum
                                );
                                preempt = true;
                                need_new_input = true;
                                input.time_spent_in_quantum = 0;
                                core.stats.bump(SchedStat::QuantumPreempts);
                            }
                        }
                    }
                }
                _ => {}
            }
            if self.options.deps == DepsMode::Timestamps
                && self.options.mapping != MappingMode::AsPreviously
                // For dynamic scheduling, honoring the asked-for switch rate
                // matters more than trace-buffer timestamp ordering.
                && self.options.mapping != MappingMode::ToAnyOutput
            {
                if let Some(ts) = record.timestamp() {
                    input.next_timestamp = ts;
                    need_new_input = true;
                }
            }
            if need_new_input {
                let prev_input = core.cur_input;
                trace!("next_record[{out}]: need new input (cur={input_idx})");
                // The candidate goes back on the queue before the lock is
                // released: another output may grab this input.
                input.queue.push_back(record.clone());
                drop(input);
                let res = self.pick_next_input(out, core, blocked_time);
                match res {
                    Ok(()) | Err(Status::Wait) | Err(Status::Skipped) => {}
                    Err(other) => return Err(other),
                }
                if core.cur_input != prev_input {
                    let switched_from = prev_input.expect("had an input before switching");
                    {
                        let mut prev_state = self.input(switched_from);
                        // Undo the quantum overshoot charged to the outgoing
                        // input, unless a preempt already reset it.
                        if !preempt && self.options.mapping == MappingMode::ToAnyOutput {
                            match self.options.quantum_unit {
                                QuantumUnit::Instructions => {
                                    if record.is_instr_boundary(&core.last_record) {
                                        debug_assert!(prev_state.instrs_in_quantum > 0);
                                        prev_state.instrs_in_quantum =
                                            prev_state.instrs_in_quantum.saturating_sub(1);
                                    }
                                }
                                QuantumUnit::Time => {
                                    let delta = cur_time - prev_time_in_quantum;
                                    debug_assert!(prev_state.time_spent_in_quantum >= delta);
                                    prev_state.time_spent_in_quantum =
                                        prev_state.time_spent_in_quantum.saturating_sub(delta);
                                }
                            }
                        }
                    }
                    if res == Err(Status::Wait) {
                        return Err(Status::Wait);
                    }
                    input_idx = core.cur_input.ok_or(Status::Invalid)?;
                    input = self.input(input_idx);
                    continue;
                } else {
                    input = self.input(input_idx);
                    if res != Err(Status::Skipped) {
                        // Take the candidate back.
                        record = input.queue.pop_back().ok_or(Status::Invalid)?;
                    }
                    if res == Err(Status::Skipped) {
                        input.needs_advance = false;
                        continue;
                    }
                }
            }
            if input.needs_roi
                && self.options.mapping != MappingMode::AsPreviously
                && !input.regions_of_interest.is_empty()
            {
                match self.advance_region_of_interest(Some(&mut *core), &mut record, &mut input) {
                    RoiResult::Skipped => {
                        // Loop back to read from the queue or re-deref the
                        // reader, but do not re-enter the ROI check.
                        input.needs_roi = false;
                        input.needs_advance = false;
                        continue;
                    }
                    RoiResult::EofOrIdle => {
                        drop(input);
                        return Err(self.eof_or_idle(out, core, None, Some(input_idx)));
                    }
                    RoiResult::Failed(status) => return Err(status),
                    RoiResult::Ok => {}
                }
            } else {
                input.needs_roi = true;
            }
            break;
        }
        if let Some(tid) = record.tid() {
            input.last_record_tid = tid;
        }
        if let Some(pid) = record.pid() {
            input.pid = pid;
        }
        if record.is_instr_boundary(&core.last_record) {
            core.delivered_instrs += 1;
        }
        core.last_record = record.clone();
        Ok(record)
    }

    // -----------------------------------------------------------------
    // Stream support operations
    // -----------------------------------------------------------------

    pub(crate) fn unread_last_record(&self, out: usize) -> Result<R, Status> {
        if !R::UNREAD_SUPPORTED {
            return Err(Status::NotImplemented);
        }
        let mut core = self.outputs[out].core.lock().expect("output core poisoned");
        if core.last_record.is_invalid() {
            return Err(Status::Invalid);
        }
        if !core.speculation_stack.is_empty() {
            return Err(Status::Invalid);
        }
        let record = core.last_record.clone();
        let input_idx = core.cur_input.ok_or(Status::Invalid)?;
        let mut input = self.input(input_idx);
        trace!("unread_last_record[{out}]: from input {input_idx}");
        input.queue.push_back(record.clone());
        if self.options.quantum_unit == QuantumUnit::Instructions && record.is_instr() {
            input.instrs_in_quantum = input.instrs_in_quantum.saturating_sub(1);
        }
        core.last_record = R::invalid();
        Ok(record)
    }

    pub(crate) fn start_speculation(
        &self,
        out: usize,
        start_address: u64,
        queue_current: bool,
    ) -> Result<(), Status> {
        let mut core = self.outputs[out].core.lock().expect("output core poisoned");
        if core.speculation_stack.is_empty() {
            if queue_current {
                if core.last_record.is_invalid() {
                    return Err(Status::Invalid);
                }
                let input_idx = core.cur_input.ok_or(Status::Invalid)?;
                let record = core.last_record.clone();
                self.input(input_idx).queue.push_back(record);
            }
            // The trace itself stores the resumption context for the outer
            // layer, so a sentinel suffices.
            const SPECULATION_OUTER_ADDRESS: u64 = 0;
            core.speculation_stack.push(SPECULATION_OUTER_ADDRESS);
        } else if queue_current {
            // Re-querying the speculator on resume assumes a repeatable
            // response for the same pc.
            let resume = core.prev_speculate_pc;
            core.speculation_stack.push(resume);
        } else {
            let resume = core.speculate_pc;
            core.speculation_stack.push(resume);
        }
        core.prev_speculate_pc = core.speculate_pc;
        core.speculate_pc = start_address;
        debug!(
            "start_speculation[{out}] layer={} pc={start_address:#x}",
            core.speculation_stack.len()
        );
        Ok(())
    }

    pub(crate) fn stop_speculation(&self, out: usize) -> Result<(), Status> {
        let mut core = self.outputs[out].core.lock().expect("output core poisoned");
        let Some(resume) = core.speculation_stack.pop() else {
            return Err(Status::Invalid);
        };
        if !core.speculation_stack.is_empty() {
            // Only inner layers resume to a stored pc.
            core.speculate_pc = resume;
        }
        debug!(
            "stop_speculation[{out}] layer={}",
            core.speculation_stack.len()
        );
        Ok(())
    }

    pub(crate) fn set_output_active(&self, out: usize, active: bool) -> Result<(), Status> {
        if self.options.mapping != MappingMode::ToAnyOutput {
            return Err(Status::Invalid);
        }
        let slot = &self.outputs[out];
        if slot.active.load(Ordering::Acquire) == active {
            return Ok(());
        }
        slot.active.store(active, Ordering::Release);
        debug!(
            "output stream {out} is now {}",
            if active { "active" } else { "inactive" }
        );
        let mut core = slot.core.lock().expect("output core poisoned");
        let mut guard = self.lock_sched();
        if !active {
            // Release the input for other outputs; its quantum resets with
            // it. With an empty queue we are not mid-candidate.
            if let Some(cur) = core.cur_input {
                let mut input = self.input(cur);
                if input.queue.is_empty() {
                    input.switching_pre_instruction = true;
                }
            }
            self.set_cur_input(out, &mut core, None, Some(&mut guard));
        } else {
            core.waiting = true;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Stream accessors
    // -----------------------------------------------------------------

    fn with_core<T>(&self, out: usize, f: impl FnOnce(&mut OutputCore<R>) -> T) -> T {
        let mut core = self.outputs[out].core.lock().expect("output core poisoned");
        f(&mut core)
    }

    fn with_cur_input<T: Default>(&self, out: usize, f: impl FnOnce(&InputState<R>) -> T) -> T {
        let cur = self.with_core(out, |core| core.cur_input);
        match cur {
            Some(idx) => f(&self.input(idx)),
            None => T::default(),
        }
    }

    pub(crate) fn input_ordinal(&self, out: usize) -> Option<usize> {
        self.with_core(out, |core| core.cur_input)
    }

    pub(crate) fn tid(&self, out: usize) -> i64 {
        let cur = self.with_core(out, |core| core.cur_input);
        match cur {
            Some(idx) => {
                let input = self.input(idx);
                if input.is_combined_stream() {
                    input.last_record_tid
                } else {
                    input.tid
                }
            }
            None => -1,
        }
    }

    pub(crate) fn pid(&self, out: usize) -> i64 {
        self.with_cur_input(out, |input| input.pid)
    }

    pub(crate) fn workload_ordinal(&self, out: usize) -> Option<usize> {
        let cur = self.with_core(out, |core| core.cur_input)?;
        Some(self.input(cur).workload)
    }

    pub(crate) fn shard_index(&self, out: usize) -> usize {
        if self.options.use_input_ordinals || self.options.use_single_input_ordinals {
            let single_combined =
                self.inputs.len() == 1 && self.input(0).is_combined_stream();
            if single_combined {
                let tid = self.tid(out);
                let mut map = self.tid2shard.lock().expect("tid2shard poisoned");
                let next = map.len();
                return *map.entry(tid).or_insert(next);
            }
            return self.input_ordinal(out).unwrap_or(0);
        }
        out
    }

    pub(crate) fn output_cpuid(&self, out: usize) -> u64 {
        self.with_core(out, |core| core.as_traced_cpuid)
            .unwrap_or(out as u64)
    }

    pub(crate) fn record_is_synthetic(&self, out: usize) -> bool {
        let (cur, in_switch) =
            self.with_core(out, |core| (core.cur_input, core.in_context_switch_code));
        if in_switch {
            return true;
        }
        match cur {
            Some(idx) => self.input(idx).reader.is_record_synthetic(),
            None => false,
        }
    }

    pub(crate) fn record_is_kernel(&self, out: usize) -> bool {
        let cur = self.with_core(out, |core| core.cur_input);
        match cur {
            Some(idx) => self.input(idx).reader.is_record_kernel(),
            None => false,
        }
    }

    pub(crate) fn input_record_ordinal(&self, out: usize) -> u64 {
        self.with_cur_input(out, |input| {
            let mut ord = input.reader.record_ordinal();
            if input.instr_ordinal() == 0 {
                // Net out the init-time readahead still sitting in the
                // queue.
                ord = ord.saturating_sub(
                    input.queue.len() as u64 + u64::from(input.cur_from_queue),
                );
            }
            ord
        })
    }

    pub(crate) fn input_instr_ordinal(&self, out: usize) -> u64 {
        self.with_cur_input(out, |input| input.instr_ordinal())
    }

    pub(crate) fn input_first_timestamp(&self, out: usize) -> u64 {
        self.with_cur_input(out, |input| {
            if input.instr_ordinal() == 0 && (!input.queue.is_empty() || input.cur_from_queue) {
                0
            } else {
                input.reader.first_timestamp()
            }
        })
    }

    pub(crate) fn input_last_timestamp(&self, out: usize) -> u64 {
        self.with_cur_input(out, |input| {
            if input.instr_ordinal() == 0 && (!input.queue.is_empty() || input.cur_from_queue) {
                0
            } else {
                input.reader.last_timestamp()
            }
        })
    }

    pub(crate) fn input_version(&self, out: usize) -> u64 {
        self.with_cur_input(out, |input| input.reader.version())
    }

    pub(crate) fn input_filetype(&self, out: usize) -> u64 {
        self.with_cur_input(out, |input| input.reader.filetype())
    }

    pub(crate) fn input_cache_line_size(&self, out: usize) -> u64 {
        self.with_cur_input(out, |input| input.reader.cache_line_size())
    }

    pub(crate) fn input_chunk_instr_count(&self, out: usize) -> u64 {
        self.with_cur_input(out, |input| input.reader.chunk_instr_count())
    }

    pub(crate) fn input_page_size(&self, out: usize) -> u64 {
        self.with_cur_input(out, |input| input.reader.page_size())
    }

    pub(crate) fn input_name(&self, out: usize) -> String {
        self.with_cur_input(out, |input| input.reader.stream_name())
    }

    pub(crate) fn statistic(&self, out: usize, stat: SchedStat) -> u64 {
        self.with_core(out, |core| core.stats.get(stat))
    }
}

impl<R: TraceRecord> Drop for SchedulerImpl<R> {
    fn drop(&mut self) {
        for (i, slot) in self.outputs.iter().enumerate() {
            let core = slot.core.lock().expect("output core poisoned");
            info!("stats for output #{i}:");
            for stat in SchedStat::all() {
                info!("  {:<24}: {:>9}", stat.label(), core.stats.get(stat));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Multi-output trace scheduler.
///
/// Construct with [`Scheduler::init`], then pull one [`OutputStream`] per
/// simulated core. Each stream must be driven by a single thread; the
/// scheduler itself is shared.
pub struct Scheduler<R: TraceRecord> {
    inner: Arc<SchedulerImpl<R>>,
}

impl<R: TraceRecord> Scheduler<R> {
    /// Builds the scheduler: opens and filters inputs, applies modifiers,
    /// ingests any replay schedules, and installs the initial assignment.
    pub fn init(
        workloads: Vec<WorkloadSpec<R>>,
        output_count: usize,
        options: SchedulerOptions,
        io: SchedulerIo<R>,
    ) -> Result<Self, InitError> {
        let inner = build(workloads, output_count, options, io)?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn output_count(&self) -> usize {
        self.inner.outputs.len()
    }

    pub fn input_count(&self) -> usize {
        self.inner.inputs.len()
    }

    /// The stream for one output. One driving thread per stream.
    ///
    /// Returns `None` for out-of-range ordinals or when
    /// `single_lockstep_output` is set (use
    /// [`lockstep_stream`](Self::lockstep_stream)).
    pub fn stream(&self, output: usize) -> Option<OutputStream<R>> {
        if output >= self.inner.outputs.len() || self.inner.options.single_lockstep_output {
            return None;
        }
        Some(OutputStream::new(Arc::clone(&self.inner), output, None))
    }

    /// The single fused stream when `single_lockstep_output` is set: each
    /// call round-robins across the outputs.
    pub fn lockstep_stream(&self) -> Option<OutputStream<R>> {
        if !self.inner.options.single_lockstep_output {
            return None;
        }
        Some(OutputStream::new(
            Arc::clone(&self.inner),
            0,
            Some(self.inner.outputs.len()),
        ))
    }

    /// Closes every output's recorded schedule with a footer and writes the
    /// components to the attached record stream.
    pub fn write_recorded_schedule(&self) -> Result<(), InitError> {
        let inner = &self.inner;
        let mut writer_guard = inner.schedule_writer.lock().expect("writer lock poisoned");
        let Some(writer) = writer_guard.as_mut() else {
            return Err(InitError::invalid_parameter(
                "no schedule record stream attached",
            ));
        };
        let _sched = inner.lock_sched();
        for (i, slot) in inner.outputs.iter().enumerate() {
            let mut core = slot.core.lock().expect("output core poisoned");
            inner.record_schedule_segment(&mut core, SegmentType::Footer, 0, 0, 0);
            let name = output_component_name(i);
            writer
                .open_component(&name)
                .map_err(|e| InitError::file_write(format!("open {name}: {e}")))?;
            let mut bytes = Vec::with_capacity(core.record.len() * 40);
            for segment in &core.record {
                segment.encode(&mut bytes);
            }
            writer
                .write_all(&bytes)
                .map_err(|e| InitError::file_write(e.to_string()))?;
        }
        writer
            .finish()
            .map_err(|e| InitError::file_write(e.to_string()))?;
        Ok(())
    }
}

fn build<R: TraceRecord>(
    mut workloads: Vec<WorkloadSpec<R>>,
    output_count: usize,
    mut options: SchedulerOptions,
    mut io: SchedulerIo<R>,
) -> Result<SchedulerImpl<R>, InitError> {
    options.validate()?;
    if output_count == 0 {
        return Err(InitError::invalid_parameter("output_count must be > 0"));
    }

    let mut inputs: Vec<InputState<R>> = Vec::new();
    let mut tid2input: AHashMap<(usize, i64), usize> = AHashMap::new();
    let mut workload2inputs: Vec<Vec<usize>> = vec![Vec::new(); workloads.len()];

    for (workload_idx, workload) in workloads.iter_mut().enumerate() {
        if !workload.only_threads.is_empty() && !workload.only_shards.is_empty() {
            return Err(InitError::invalid_parameter(
                "only_threads and only_shards are mutually exclusive",
            ));
        }
        let mut unfiltered_tids: Vec<i64> = Vec::new();
        let mut shard_count = 0usize;
        match std::mem::replace(
            &mut workload.source,
            WorkloadSource::Readers(Vec::new()),
        ) {
            WorkloadSource::Readers(readers) => {
                if readers.is_empty() {
                    return Err(InitError::invalid_parameter(
                        "workload has neither path nor readers",
                    ));
                }
                shard_count = readers.len();
                for (shard, spec) in readers.into_iter().enumerate() {
                    unfiltered_tids.push(spec.tid);
                    if !workload.only_threads.is_empty()
                        && !workload.only_threads.contains(&spec.tid)
                    {
                        continue;
                    }
                    if !workload.only_shards.is_empty() && !workload.only_shards.contains(&shard) {
                        continue;
                    }
                    let index = inputs.len();
                    let state = InputState::new(index, workload_idx, spec.tid, spec.reader);
                    tid2input.insert((workload_idx, spec.tid), index);
                    workload2inputs[workload_idx].push(index);
                    inputs.push(state);
                }
            }
            WorkloadSource::Path(path) => {
                let factory = io.reader_factory.as_deref().ok_or_else(|| {
                    InitError::invalid_parameter(
                        "path-based workloads require a reader factory",
                    )
                })?;
                let files = if path.is_dir() {
                    crate::workload::list_trace_files(&path)
                        .map_err(|e| InitError::file_open(format!("{}: {e}", path.display())))?
                } else {
                    vec![path.clone()]
                };
                if files.is_empty() {
                    return Err(InitError::invalid_parameter(format!(
                        "no input files under {}",
                        path.display()
                    )));
                }
                shard_count = files.len();
                for (shard, file) in files.iter().enumerate() {
                    let mut reader = factory
                        .open(file)
                        .map_err(|e| InitError::file_open(format!("{}: {e}", file.display())))?;
                    reader
                        .init()
                        .map_err(|e| InitError::file_open(format!("{}: {e}", file.display())))?;
                    // The tid is needed up front; read to the first record
                    // that carries one, queueing what came before.
                    let mut queued: Vec<R> = Vec::new();
                    let mut tid = None;
                    while !reader.at_end() {
                        let record = reader.current();
                        if let Some(t) = record.tid() {
                            tid = Some(t);
                            break;
                        }
                        queued.push(record);
                        reader.advance();
                    }
                    let Some(tid) = tid else {
                        return Err(InitError::file_read(format!(
                            "failed to find a thread id in {}",
                            file.display()
                        )));
                    };
                    unfiltered_tids.push(tid);
                    if !workload.only_threads.is_empty() && !workload.only_threads.contains(&tid) {
                        continue;
                    }
                    if !workload.only_shards.is_empty() && !workload.only_shards.contains(&shard) {
                        continue;
                    }
                    debug!("opened reader for tid {tid} {}", file.display());
                    let index = inputs.len();
                    let mut state = InputState::new(index, workload_idx, tid, reader);
                    state.needs_init = false;
                    state.queue.extend(queued);
                    tid2input.insert((workload_idx, tid), index);
                    workload2inputs[workload_idx].push(index);
                    inputs.push(state);
                }
            }
        }
        // Validate the filters against what the workload actually holds.
        for &ord in &workload.only_shards {
            if ord >= shard_count {
                return Err(InitError::invalid_parameter(format!(
                    "only_shards entry {ord} out of bounds for a shard ordinal"
                )));
            }
        }
        for &tid in &workload.only_threads {
            if !unfiltered_tids.contains(&tid) {
                return Err(InitError::invalid_parameter(format!(
                    "only_threads entry {tid} not found in workload inputs"
                )));
            }
        }
    }

    if inputs.is_empty() {
        return Err(InitError::invalid_parameter("no inputs"));
    }

    // Times-of-interest conversion consumes the as-traced stream.
    for (workload_idx, workload) in workloads.iter_mut().enumerate() {
        if workload.times_of_interest.is_empty() {
            continue;
        }
        for modifiers in &workload.thread_modifiers {
            if !modifiers.regions_of_interest.is_empty() {
                return Err(InitError::invalid_parameter(
                    "times_of_interest cannot mix with explicit regions_of_interest",
                ));
            }
        }
        let replay_stream = io.replay_as_traced.as_deref_mut().ok_or_else(|| {
            InitError::invalid_parameter("times_of_interest requires an as-traced stream")
        })?;
        let mut tids_here: AHashMap<i64, usize> = AHashMap::new();
        for &input_idx in &workload2inputs[workload_idx] {
            tids_here.insert(inputs[input_idx].tid, input_idx);
        }
        let new_modifiers = regions_from_times(
            replay_stream,
            &tids_here,
            inputs.len(),
            &workload.times_of_interest,
        )?;
        workload.thread_modifiers.extend(new_modifiers);
        // A replay mode must not reuse the consumed stream.
        io.replay_as_traced = None;
    }

    // Apply per-thread modifiers.
    for (workload_idx, workload) in workloads.iter().enumerate() {
        for modifiers in &workload.thread_modifiers {
            let mut all_tids: Vec<i64> = Vec::new();
            let which_tids: &[i64] = if modifiers.tids.is_empty() {
                // All tids without an earlier modifier.
                for &input_idx in &workload2inputs[workload_idx] {
                    if !inputs[input_idx].has_modifier {
                        all_tids.push(inputs[input_idx].tid);
                    }
                }
                &all_tids
            } else {
                &modifiers.tids
            };
            for &tid in which_tids {
                let &index = tid2input.get(&(workload_idx, tid)).ok_or_else(|| {
                    InitError::invalid_parameter(format!(
                        "modifier tid {tid} not found in workload {workload_idx}"
                    ))
                })?;
                let state = &mut inputs[index];
                state.has_modifier = true;
                state.binding = modifiers.output_binding.clone();
                state.priority = modifiers.priority;
                for (i, range) in modifiers.regions_of_interest.iter().enumerate() {
                    debug!(
                        "ROI #{i} for input {index}: [{}, {})",
                        range.start_instruction, range.stop_instruction
                    );
                    if range.start_instruction == 0
                        || (range.stop_instruction < range.start_instruction
                            && range.stop_instruction != 0)
                    {
                        return Err(InitError::invalid_parameter("invalid region of interest"));
                    }
                    if i > 0
                        && range.start_instruction
                            <= modifiers.regions_of_interest[i - 1].stop_instruction
                    {
                        return Err(InitError::invalid_parameter(
                            "gap required between regions of interest",
                        ));
                    }
                }
                state.regions_of_interest = modifiers.regions_of_interest.clone();
            }
        }
    }

    if options.use_single_input_ordinals && inputs.len() == 1 && output_count == 1 {
        options.use_input_ordinals = true;
    }
    // Nops are the only supported speculation flavor today.
    options.speculate_nops = true;

    let mut outputs: Vec<OutputSlot<R>> = Vec::with_capacity(output_count);
    for _ in 0..output_count {
        outputs.push(OutputSlot::new(Speculator::new(SpeculatorKind::Nops)));
    }

    let live_input_count = CachePadded::new(AtomicI64::new(inputs.len() as i64));
    info!("{} inputs", inputs.len());

    // Kernel context-switch sequences.
    let mut switch_sequence_thread: Vec<R> = Vec::new();
    let mut switch_sequence_process: Vec<R> = Vec::new();
    let switch_reader: Option<Box<dyn RecordReader<R>>> = match io.kernel_switch_reader.take() {
        Some(reader) => Some(reader),
        None => match &io.kernel_switch_path {
            Some(path) => {
                let factory = io.reader_factory.as_deref().ok_or_else(|| {
                    InitError::invalid_parameter("kernel_switch_path requires a reader factory")
                })?;
                Some(factory.open(path).map_err(|e| {
                    InitError::file_open(format!("kernel switch file {}: {e}", path.display()))
                })?)
            }
            None => None,
        },
    };
    if let Some(mut reader) = switch_reader {
        reader
            .init()
            .map_err(|e| InitError::file_open(format!("kernel switch reader: {e}")))?;
        read_switch_sequences(
            &mut *reader,
            &mut switch_sequence_thread,
            &mut switch_sequence_process,
        )?;
    }

    let rng_seed = options.rng_seed;
    let mut scheduler = SchedulerImpl {
        options,
        inputs: inputs.into_iter().map(Mutex::new).collect(),
        outputs,
        sched: Mutex::new(SchedState {
            ready: InputQueue::new(),
            unscheduled: InputQueue::new(),
            num_blocked: 0,
            rng: XorShift64::new(rng_seed),
        }),
        tid2input,
        tid2shard: Mutex::new(AHashMap::new()),
        switch_sequence_thread,
        switch_sequence_process,
        live_input_count,
        live_replay_output_count: CachePadded::new(AtomicI64::new(0)),
        schedule_writer: Mutex::new(io.schedule_record.take()),
        start: Instant::now(),
    };
    if scheduler.recording() {
        for slot in &scheduler.outputs {
            let mut core = slot.core.lock().expect("output core poisoned");
            scheduler.record_schedule_segment(
                &mut core,
                SegmentType::Version,
                SCHEDULE_VERSION_CURRENT,
                0,
                0,
            );
        }
    }

    set_initial_schedule(&mut scheduler, &workload2inputs, &mut io)?;
    Ok(scheduler)
}

/// Parses the kernel switch trace into per-kind record sequences.
fn read_switch_sequences<R: TraceRecord>(
    reader: &mut dyn RecordReader<R>,
    thread_seq: &mut Vec<R>,
    process_seq: &mut Vec<R>,
) -> Result<(), InitError> {
    let mut cur: Option<SwitchKind> = None;
    while !reader.at_end() {
        let record = reader.current();
        if let Some((MarkerKind::ContextSwitchStart, value)) = record.marker() {
            let kind = SwitchKind::from_marker_value(value).ok_or_else(|| {
                InitError::invalid_parameter("unknown context switch sequence type")
            })?;
            let target = match kind {
                SwitchKind::Thread => &mut *thread_seq,
                SwitchKind::Process => &mut *process_seq,
            };
            if !target.is_empty() {
                return Err(InitError::invalid_parameter(
                    "duplicate context switch sequence type found",
                ));
            }
            cur = Some(kind);
        }
        if let Some(kind) = cur {
            match kind {
                SwitchKind::Thread => thread_seq.push(record.clone()),
                SwitchKind::Process => process_seq.push(record.clone()),
            }
        }
        if let Some((MarkerKind::ContextSwitchEnd, value)) = record.marker() {
            if cur.map(|k| k.marker_value()) != Some(value) {
                return Err(InitError::invalid_parameter(
                    "context switch marker values mismatched",
                ));
            }
            if let Some(kind) = cur {
                let len = match kind {
                    SwitchKind::Thread => thread_seq.len(),
                    SwitchKind::Process => process_seq.len(),
                };
                info!("read {len} kernel context switch records for {kind:?}");
            }
            cur = None;
        }
        reader.advance();
    }
    Ok(())
}

/// Converts requested time ranges to per-thread instruction ROIs using the
/// as-traced schedule's (timestamp, instruction) pairs.
fn regions_from_times(
    replay_stream: &mut dyn crate::scheduler::segments::ComponentRead,
    workload_tids: &AHashMap<i64, usize>,
    input_count: usize,
    times: &[TimeRange],
) -> Result<Vec<crate::workload::ThreadModifiers>, InitError> {
    let sched = read_traced_schedule(replay_stream, workload_tids, input_count, None)?;
    // An interval tree keyed only by start: intervals neither overlap nor
    // leave gaps.
    let mut time_tree: Vec<std::collections::BTreeMap<u64, u64>> =
        vec![std::collections::BTreeMap::new(); input_count];
    for (input_idx, entries) in sched.input_sched.iter().enumerate() {
        for entry in entries {
            time_tree[input_idx].insert(entry.timestamp, entry.start_instruction);
        }
    }

    let mut result = Vec::new();
    for (&tid, &input_idx) in workload_tids {
        let mut instr_ranges: Vec<InstrRange> = Vec::new();
        let mut entire_tid = false;
        for range in times {
            let mut instr_start = 0u64;
            let mut instr_end = 0u64;
            let has_start =
                time_tree_lookup(&time_tree[input_idx], range.start_timestamp, &mut instr_start);
            let has_end = if range.stop_timestamp == 0 {
                true
            } else {
                time_tree_lookup(&time_tree[input_idx], range.stop_timestamp, &mut instr_end)
            };
            if has_start && has_end && instr_start == instr_end {
                if instr_start == 0 && instr_end == 0 {
                    entire_tid = true;
                } else {
                    instr_end += 1;
                }
            }
            // Without a start the range includes from 0; without an end,
            // instr_end of 0 already means end-of-trace.
            if instr_start > 0 || instr_end > 0 {
                if let Some(last) = instr_ranges.last() {
                    if last.stop_instruction >= instr_start || last.stop_instruction == 0 {
                        return Err(InitError::invalid_parameter(
                            "times_of_interest are too close together: \
                             corresponding instruction ordinals overlap or are adjacent",
                        ));
                    }
                }
                debug!(
                    "tid {tid} overlaps with times [{}, {}) @ [{instr_start}, {instr_end})",
                    range.start_timestamp, range.stop_timestamp
                );
                instr_ranges.push(InstrRange::new(instr_start, instr_end));
            }
        }
        if !entire_tid && instr_ranges.is_empty() {
            // No overlap: exclude the thread entirely by giving it an
            // unreachable start point.
            debug!("tid {tid} has no overlap with any times_of_interest entry");
            instr_ranges.push(InstrRange::new(u64::MAX, 0));
        }
        if !entire_tid {
            let mut modifiers = crate::workload::ThreadModifiers::with_regions(instr_ranges);
            modifiers.tids.push(tid);
            result.push(modifiers);
        }
    }
    Ok(result)
}

/// Interpolates a timestamp to an instruction ordinal between the two
/// bracketing schedule entries. Rounds down so a syscall spanning the start
/// time is included (the blocked state at that point matters more than a
/// few extra instructions).
fn time_tree_lookup(
    tree: &std::collections::BTreeMap<u64, u64>,
    time: u64,
    ordinal: &mut u64,
) -> bool {
    let mut after = tree.range((
        std::ops::Bound::Excluded(time),
        std::ops::Bound::Unbounded,
    ));
    let Some((&upper_time, &upper_ord)) = after.next() else {
        // No footer timestamp exists, so anything past the last known
        // timestamp cannot be placed.
        return false;
    };
    let mut before = tree.range(..=time);
    let Some((&lower_time, &lower_ord)) = before.next_back() else {
        return false;
    };
    let fraction = (time - lower_time) as f64 / (upper_time - lower_time) as f64;
    let interpolated = lower_ord as f64 + fraction * (upper_ord as f64 - lower_ord as f64);
    *ordinal = interpolated as u64;
    true
}

/// Reads ahead in `input` classifying the init-time header records.
/// Returns false once reading should stop.
fn process_next_initial_record<R: TraceRecord>(
    options: &SchedulerOptions,
    input: &mut InputState<R>,
    record: &R,
    found_filetype: &mut bool,
    found_timestamp: &mut bool,
) -> bool {
    if record.is_invalid() {
        return true; // Sentinel on the first call.
    }
    if record.is_non_marker_header() {
        return true;
    }
    let Some((kind, value)) = record.marker() else {
        trace!("stopping initial readahead at non-marker");
        return false;
    };
    match kind {
        MarkerKind::Filetype => {
            *found_filetype = true;
            debug!("input {} filetype {value}", input.index);
        }
        MarkerKind::Timestamp => {
            if !*found_timestamp {
                // The first timestamp wins even when reading further ahead.
                input.next_timestamp = value;
                *found_timestamp = true;
            } else {
                // A second timestamp would skew interval counting.
                trace!("stopping initial readahead at 2nd timestamp");
                return false;
            }
        }
        MarkerKind::SyscallUnschedule => {
            // Before any instruction this marks the initial exit from an
            // unschedule syscall the tracer attached inside: the input
            // starts out unscheduled.
            if options.honor_direct_switches && options.mapping != MappingMode::AsPreviously {
                input.unscheduled = true;
                input.skip_next_unscheduled = true;
            }
            return false;
        }
        _ => {}
    }
    true
}

fn get_initial_input_content<R: TraceRecord>(
    scheduler: &SchedulerImpl<R>,
    gather_timestamps: bool,
) -> Result<(), InitError> {
    debug!(
        "reading input headers for filetypes{}",
        if gather_timestamps { " and timestamps" } else { "" }
    );
    for slot in &scheduler.inputs {
        let mut input = slot.lock().expect("input lock poisoned");
        let input = &mut *input;

        // An input starting mid-trace skips now so the start timestamp is
        // the right one. (Replay ignores user ROIs.)
        if !input.regions_of_interest.is_empty()
            && scheduler.options.mapping != MappingMode::AsPreviously
        {
            let mut record = R::invalid();
            match scheduler.advance_region_of_interest(None, &mut record, input) {
                RoiResult::Skipped => {
                    input.next_timestamp = input.reader.last_timestamp();
                    // The filetype is in the stream after the skip.
                    continue;
                }
                RoiResult::Ok => {}
                RoiResult::EofOrIdle | RoiResult::Failed(_) => {
                    return Err(InitError::invalid_parameter(
                        "failed to advance initial region of interest",
                    ));
                }
            }
        }

        let mut found_filetype = false;
        let mut found_timestamp = !gather_timestamps || input.next_timestamp > 0;
        let sentinel = R::invalid();
        let mut keep_reading = process_next_initial_record(
            &scheduler.options,
            input,
            &sentinel,
            &mut found_filetype,
            &mut found_timestamp,
        );
        if keep_reading {
            // Queued records first (path-based opens buffered some).
            let queued: Vec<R> = input.queue.iter().cloned().collect();
            for record in &queued {
                if !process_next_initial_record(
                    &scheduler.options,
                    input,
                    record,
                    &mut found_filetype,
                    &mut found_timestamp,
                ) {
                    keep_reading = false;
                    break;
                }
            }
        }
        if input.next_timestamp > 0 {
            found_timestamp = true;
        }
        if keep_reading
            && process_next_initial_record(
                &scheduler.options,
                input,
                &sentinel,
                &mut found_filetype,
                &mut found_timestamp,
            )
        {
            input
                .ensure_init()
                .map_err(|e| InitError::file_open(e.to_string()))?;
            while !input.reader.at_end() {
                let record = input.reader.current();
                if record.is_instr() {
                    input.instrs_pre_read += 1;
                }
                if !process_next_initial_record(
                    &scheduler.options,
                    input,
                    &record,
                    &mut found_filetype,
                    &mut found_timestamp,
                ) {
                    break;
                }
                // Legacy traces have no filetype marker; give up at the
                // first timestamp or page-size marker with filetype 0.
                if !found_filetype
                    && (record.timestamp().is_some()
                        || matches!(record.marker(), Some((MarkerKind::PageSize, _))))
                {
                    debug!("no filetype found: assuming legacy input");
                    found_filetype = true;
                    if !gather_timestamps {
                        break;
                    }
                }
                // An instruction means a malformed header region or a
                // timestamp thousands of records away; do not chase it.
                if record.is_instr() {
                    break;
                }
                input.queue.push_back(record);
                input.reader.advance();
            }
        }
        if gather_timestamps && input.next_timestamp == 0 {
            return Err(InitError::invalid_parameter(
                "failed to find an initial timestamp",
            ));
        }
    }
    Ok(())
}

fn set_initial_schedule<R: TraceRecord>(
    scheduler: &mut SchedulerImpl<R>,
    workload2inputs: &[Vec<usize>],
    io: &mut SchedulerIo<R>,
) -> Result<(), InitError> {
    // Reading ahead blocks forever on unavailable inputs (e.g. online
    // readers), so only do it where the mode demands it.
    let gather_timestamps = (matches!(
        scheduler.options.mapping,
        MappingMode::AsPreviously | MappingMode::ToAnyOutput
    ) && scheduler.options.deps == DepsMode::Timestamps)
        || (scheduler.options.mapping == MappingMode::ToRecordedOutput
            && io.replay_as_traced.is_none()
            && scheduler.inputs.len() > 1);
    if gather_timestamps && !scheduler.options.read_inputs_in_init {
        return Err(InitError::invalid_parameter(
            "timestamp dependencies require read_inputs_in_init",
        ));
    }
    if scheduler.options.read_inputs_in_init || gather_timestamps {
        get_initial_input_content(scheduler, gather_timestamps)?;
    }

    match scheduler.options.mapping {
        MappingMode::AsPreviously => {
            scheduler
                .live_replay_output_count
                .store(scheduler.outputs.len() as i64, Ordering::Release);
            if scheduler.recording() {
                return Err(InitError::invalid_parameter(
                    "cannot record and replay in the same run",
                ));
            }
            let replay_stream = io.schedule_replay.as_deref_mut().ok_or_else(|| {
                InitError::invalid_parameter("AsPreviously requires a schedule replay stream")
            })?;
            let per_output = read_recorded_schedule(replay_stream, scheduler.outputs.len())?;
            for (i, segments) in per_output.into_iter().enumerate() {
                scheduler.outputs[i].replay = segments;
            }
            for i in 0..scheduler.outputs.len() {
                let first = scheduler.outputs[i].replay.first().copied();
                let mut core = scheduler.outputs[i]
                    .core
                    .lock()
                    .expect("output core poisoned");
                match first {
                    None => {
                        debug!("output {i} replay empty: eof up front");
                        scheduler.set_cur_input(i, &mut core, None, None);
                        core.at_eof = true;
                        scheduler
                            .live_replay_output_count
                            .fetch_add(-1, Ordering::AcqRel);
                    }
                    Some(seg) if seg.seg_type == SegmentType::Idle => {
                        scheduler.set_cur_input(i, &mut core, None, None);
                        core.waiting = true;
                        core.wait_start_time = 0; // Stamped on first call.
                        scheduler.outputs[i].record_index.store(0, Ordering::Release);
                        debug!("output {i} starting out idle");
                    }
                    Some(seg) => {
                        debug_assert!(seg.seg_type == SegmentType::Default);
                        scheduler.outputs[i].record_index.store(0, Ordering::Release);
                        scheduler.set_cur_input(i, &mut core, Some(seg.key as usize), None);
                    }
                }
            }
        }
        _ if io.schedule_replay.is_some() => {
            return Err(InitError::invalid_parameter(
                "schedule replay stream requires AsPreviously mapping",
            ));
        }
        MappingMode::ToConsistentOutput => {
            // Static round-robin, assigned up front: the parallel fast path
            // then runs without locks.
            let output_count = scheduler.outputs.len();
            for i in 0..scheduler.inputs.len() {
                let out = i % output_count;
                let mut core = scheduler.outputs[out]
                    .core
                    .lock()
                    .expect("output core poisoned");
                if core.assigned_inputs.is_empty() {
                    scheduler.set_cur_input(out, &mut core, Some(i), None);
                }
                core.assigned_inputs.push(i);
                debug!("assigning input #{i} to output #{out}");
            }
        }
        MappingMode::ToRecordedOutput => {
            if let Some(replay_stream) = io.replay_as_traced.as_deref_mut() {
                let tid_map: AHashMap<i64, usize> = scheduler
                    .tid2input
                    .iter()
                    .map(|(&(_w, tid), &idx)| (tid, idx))
                    .collect();
                let sched = read_traced_schedule(
                    replay_stream,
                    &tid_map,
                    scheduler.inputs.len(),
                    Some(scheduler.outputs.len()),
                )?;
                let instantiated = instantiate_traced_schedule(&sched)?;
                for out in 0..scheduler.outputs.len() {
                    if out >= instantiated.per_output.len() {
                        debug!("output {out} empty: eof up front");
                        let mut core = scheduler.outputs[out]
                            .core
                            .lock()
                            .expect("output core poisoned");
                        core.at_eof = true;
                        scheduler.set_cur_input(out, &mut core, None, None);
                        continue;
                    }
                    scheduler.outputs[out].replay = instantiated.per_output[out].clone();
                    let cpuid = instantiated.cpuids[out];
                    let first = scheduler.outputs[out].replay[0];
                    let mut core = scheduler.outputs[out]
                        .core
                        .lock()
                        .expect("output core poisoned");
                    core.as_traced_cpuid = Some(cpuid);
                    info!("output #{out} is as-traced cpu #{cpuid}");
                    if first.value != 0 {
                        debug!("initial state for output #{out}: wait");
                        scheduler.set_cur_input(out, &mut core, None, None);
                        core.waiting = true;
                        scheduler.outputs[out]
                            .record_index
                            .store(-1, Ordering::Release);
                    } else {
                        debug!("initial input for output #{out} is {}", first.key);
                        scheduler.outputs[out]
                            .record_index
                            .store(0, Ordering::Release);
                        scheduler.set_cur_input(out, &mut core, Some(first.key as usize), None);
                    }
                }
                // From here on the regular replay machinery drives it.
                scheduler.options.mapping = MappingMode::AsPreviously;
                scheduler
                    .live_replay_output_count
                    .store(scheduler.outputs.len() as i64, Ordering::Release);
            } else if scheduler.outputs.len() > 1 {
                return Err(InitError::invalid_parameter(
                    "ToRecordedOutput without an as-traced stream supports one output",
                ));
            } else if scheduler.inputs.len() == 1 {
                let mut core = scheduler.outputs[0]
                    .core
                    .lock()
                    .expect("output core poisoned");
                scheduler.set_cur_input(0, &mut core, Some(0), None);
            } else {
                // Serial timestamp interleaving: start with the oldest
                // timestamp's input; its headers were queued at readahead.
                let mut min_time = u64::MAX;
                let mut min_input = None;
                for (i, slot) in scheduler.inputs.iter().enumerate() {
                    let input = slot.lock().expect("input lock poisoned");
                    if input.next_timestamp > 0 && input.next_timestamp < min_time {
                        min_time = input.next_timestamp;
                        min_input = Some(i);
                    }
                }
                let min_input = min_input.ok_or_else(|| {
                    InitError::invalid_parameter("no input timestamps for timestamp ordering")
                })?;
                let mut core = scheduler.outputs[0]
                    .core
                    .lock()
                    .expect("output core poisoned");
                scheduler.set_cur_input(0, &mut core, Some(min_input), None);
            }
        }
        _ => {
            if scheduler.options.deps == DepsMode::Timestamps {
                // Per-workload base timestamps; the queues then order by
                // relative time from each base.
                for inputs_here in workload2inputs {
                    let mut min_time = u64::MAX;
                    let mut found = false;
                    for &input_idx in inputs_here {
                        let input = scheduler.input(input_idx);
                        if input.next_timestamp < min_time {
                            min_time = input.next_timestamp;
                            found = true;
                        }
                    }
                    if !found {
                        return Err(InitError::invalid_parameter(
                            "workload has no input timestamps",
                        ));
                    }
                    for &input_idx in inputs_here {
                        let mut input = scheduler.input(input_idx);
                        input.base_timestamp = min_time;
                        input.order_by_timestamp = true;
                    }
                }
            }
            // Queue everything, then hand the first N to the outputs; the
            // queue handles bindings and time ordering.
            {
                let mut sched = scheduler.lock_sched();
                for i in 0..scheduler.inputs.len() {
                    let input = scheduler.input(i);
                    scheduler.add_to_ready_queue(&mut sched, &input);
                }
            }
            for out in 0..scheduler.outputs.len() {
                let mut sched = scheduler.lock_sched();
                let picked = scheduler.pop_from_ready_queue(&mut sched, out, 0);
                let mut core = scheduler.outputs[out]
                    .core
                    .lock()
                    .expect("output core poisoned");
                match picked {
                    Ok(next) => scheduler.set_cur_input(out, &mut core, next, Some(&mut sched)),
                    Err(_) => scheduler.set_cur_input(out, &mut core, None, Some(&mut sched)),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::VecReader;
    use crate::record::MemrefRecord;
    use crate::workload::ReaderSpec;

    fn one_input_workload(records: Vec<MemrefRecord>) -> Vec<WorkloadSpec<MemrefRecord>> {
        vec![WorkloadSpec::from_readers(vec![ReaderSpec {
            reader: Box::new(VecReader::new(records)),
            tid: 100,
        }])]
    }

    fn simple_records() -> Vec<MemrefRecord> {
        vec![
            MemrefRecord::Marker {
                tid: 100,
                pid: 1,
                kind: MarkerKind::Version,
                value: 6,
            },
            MemrefRecord::timestamp_marker(100, 1000),
            MemrefRecord::Instr {
                tid: 100,
                pid: 1,
                pc: 0x10,
                size: 4,
            },
        ]
    }

    #[test]
    fn blocked_time_scaling_respects_the_cap() {
        let options = SchedulerOptions {
            time_units_per_us: 10.0,
            block_time_multiplier: 3.0,
            block_time_max_us: 1_000,
            ..Default::default()
        };
        let sched = build(
            one_input_workload(simple_records()),
            1,
            options,
            SchedulerIo::default(),
        )
        .unwrap();
        // Under the cap: latency * multiplier * units.
        assert_eq!(sched.scale_blocked_time(100), 3_000);
        // Over the cap: clamped to max_us * units.
        assert_eq!(sched.scale_blocked_time(100_000), 10_000);
    }

    #[test]
    fn replay_stream_requires_replay_mapping() {
        let archive = crate::scheduler::segments::MemArchive::new();
        {
            use crate::scheduler::segments::ComponentWrite;
            let mut w = archive.writer();
            w.open_component("output.0000").unwrap();
            w.finish().unwrap();
        }
        let io = SchedulerIo {
            schedule_replay: Some(Box::new(archive.reader().unwrap())),
            ..Default::default()
        };
        let err = build(
            one_input_workload(simple_records()),
            1,
            SchedulerOptions::default(),
            io,
        )
        .unwrap_err();
        assert!(matches!(err, InitError::InvalidParameter(_)));
    }

    #[test]
    fn record_and_replay_together_are_rejected() {
        let archive = crate::scheduler::segments::MemArchive::new();
        {
            use crate::scheduler::segments::ComponentWrite;
            let mut w = archive.writer();
            w.open_component("output.0000").unwrap();
            w.finish().unwrap();
        }
        let io = SchedulerIo {
            schedule_record: Some(Box::new(archive.writer())),
            schedule_replay: Some(Box::new(archive.reader().unwrap())),
            ..Default::default()
        };
        let options = SchedulerOptions {
            mapping: MappingMode::AsPreviously,
            ..Default::default()
        };
        let err = build(one_input_workload(simple_records()), 1, options, io).unwrap_err();
        assert!(matches!(err, InitError::InvalidParameter(_)));
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let mut workloads = one_input_workload(simple_records());
        workloads[0].thread_modifiers = vec![crate::workload::ThreadModifiers::with_regions(
            vec![InstrRange::new(5, 10), InstrRange::new(10, 20)],
        )];
        let err = build(
            workloads,
            1,
            SchedulerOptions::default(),
            SchedulerIo::default(),
        )
        .unwrap_err();
        assert!(matches!(err, InitError::InvalidParameter(_)));
    }

    #[test]
    fn times_of_interest_reject_mixed_roi_sources() {
        let mut workloads = one_input_workload(simple_records());
        workloads[0].times_of_interest = vec![crate::workload::TimeRange {
            start_timestamp: 1,
            stop_timestamp: 2,
        }];
        workloads[0].thread_modifiers = vec![crate::workload::ThreadModifiers::with_regions(
            vec![InstrRange::new(5, 10)],
        )];
        let err = build(
            workloads,
            1,
            SchedulerOptions::default(),
            SchedulerIo::default(),
        )
        .unwrap_err();
        assert!(matches!(err, InitError::InvalidParameter(_)));
    }

    #[test]
    fn only_filters_are_mutually_exclusive() {
        let mut workloads = one_input_workload(simple_records());
        workloads[0].only_threads = vec![100];
        workloads[0].only_shards = vec![0];
        let err = build(
            workloads,
            1,
            SchedulerOptions::default(),
            SchedulerIo::default(),
        )
        .unwrap_err();
        assert!(matches!(err, InitError::InvalidParameter(_)));
    }

    #[test]
    fn time_tree_interpolation_rounds_down() {
        let mut tree = std::collections::BTreeMap::new();
        tree.insert(100u64, 0u64);
        tree.insert(200u64, 1000u64);
        let mut ordinal = 0;
        assert!(time_tree_lookup(&tree, 150, &mut ordinal));
        assert_eq!(ordinal, 500);
        assert!(time_tree_lookup(&tree, 199, &mut ordinal));
        assert_eq!(ordinal, 990);
        // Outside the known range: no placement.
        assert!(!time_tree_lookup(&tree, 50, &mut ordinal));
        assert!(!time_tree_lookup(&tree, 300, &mut ordinal));
    }
}
