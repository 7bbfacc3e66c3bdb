//! Pure transition rules applied to a [`BatchRecord`] before it is committed.
//!
//! Each function either mutates the record into its next valid shape or
//! returns `InvalidTransition` and leaves it untouched.

use crackctl_core::types::{
    AnomalyOverride, AttackPhase, BatchRecord, BatchState, JobId, PartRecord, PhaseApplication,
};

use crate::StateStoreError;

pub fn apply_part_submitted(rec: &mut BatchRecord, part: PartRecord) -> Result<(), StateStoreError> {
    let batch = rec.seq;
    if rec.state == BatchState::Archived {
        return Err(StateStoreError::transition(
            batch,
            format!("cannot submit {} to an archived batch", part.key(batch)),
        ));
    }
    if !rec.phases.contains(&part.phase) {
        return Err(StateStoreError::transition(
            batch,
            format!("phase {} is not part of this batch", part.phase),
        ));
    }
    if part.index.0 >= rec.part_count() {
        return Err(StateStoreError::transition(
            batch,
            format!(
                "part index {} out of range (batch has {} parts)",
                part.index,
                rec.part_count()
            ),
        ));
    }
    if let Some(existing) = rec.part(part.index, &part.phase) {
        return Err(StateStoreError::transition(
            batch,
            format!(
                "{} already submitted as job {}",
                part.key(batch),
                existing.job_id
            ),
        ));
    }
    if let Some(other) = rec.parts.iter().find(|p| p.job_id == part.job_id) {
        return Err(StateStoreError::transition(
            batch,
            format!(
                "job {} is already bound to {}",
                part.job_id,
                other.key(batch)
            ),
        ));
    }
    if rec.hashlist_for(part.index) != Some(part.hashlist_id) {
        return Err(StateStoreError::transition(
            batch,
            format!(
                "hashlist {} does not belong to part {}",
                part.hashlist_id, part.index
            ),
        ));
    }

    rec.parts.push(part);
    if rec.state == BatchState::Pending {
        rec.state = BatchState::Submitted;
    }
    Ok(())
}

pub fn apply_phase_applied(
    rec: &mut BatchRecord,
    phase: &AttackPhase,
    cracked: u64,
    now_unix_ms: u64,
) -> Result<(), StateStoreError> {
    let batch = rec.seq;
    if rec.state == BatchState::Archived {
        return Err(StateStoreError::transition(batch, "batch is archived"));
    }
    let Some(position) = rec.phases.iter().position(|p| p == phase) else {
        return Err(StateStoreError::transition(
            batch,
            format!("phase {phase} is not part of this batch"),
        ));
    };
    if rec.is_phase_applied(phase) {
        return Err(StateStoreError::transition(
            batch,
            format!("phase {phase} already recorded as applied"),
        ));
    }
    if let Some(earlier) = rec.phases[..position]
        .iter()
        .find(|p| !rec.is_phase_applied(p))
    {
        return Err(StateStoreError::transition(
            batch,
            format!("phase {phase} cannot be applied before {earlier}"),
        ));
    }
    let submitted = rec.parts_for_phase(phase).count() as u32;
    if submitted != rec.part_count() {
        return Err(StateStoreError::transition(
            batch,
            format!(
                "phase {phase} has {submitted}/{} parts submitted",
                rec.part_count()
            ),
        ));
    }

    rec.phases_applied.push(PhaseApplication {
        phase: phase.clone(),
        cracked,
        applied_unix_ms: now_unix_ms,
    });
    Ok(())
}

pub fn apply_observed_state(rec: &mut BatchRecord, next: BatchState) -> Result<(), StateStoreError> {
    let batch = rec.seq;
    if !matches!(
        next,
        BatchState::Running | BatchState::Complete | BatchState::Anomalous
    ) {
        return Err(StateStoreError::transition(
            batch,
            format!("{next} is not an observed state"),
        ));
    }
    if rec.parts.is_empty() {
        return Err(StateStoreError::transition(
            batch,
            format!("cannot record {next} before any part is submitted"),
        ));
    }
    if !rec.state.can_transition_to(next) {
        return Err(StateStoreError::transition(
            batch,
            format!("{} -> {next} is not a forward transition", rec.state),
        ));
    }
    if next == BatchState::Complete {
        let missing = rec.missing_parts();
        if let Some(first) = missing.first() {
            return Err(StateStoreError::transition(
                batch,
                format!(
                    "cannot be COMPLETE with {} parts unsubmitted (first: {first})",
                    missing.len()
                ),
            ));
        }
    }
    rec.state = next;
    Ok(())
}

/// Returns `false` when an identical override already exists.
pub fn apply_anomaly_override(
    rec: &mut BatchRecord,
    ov: AnomalyOverride,
) -> Result<bool, StateStoreError> {
    let batch = rec.seq;
    if rec.state == BatchState::Archived {
        return Err(StateStoreError::transition(batch, "batch is archived"));
    }
    if rec.part(ov.index, &ov.phase).is_none() {
        return Err(StateStoreError::transition(
            batch,
            format!("no submitted part {}/{} to override", ov.index, ov.phase),
        ));
    }
    if rec.is_overridden(ov.index, &ov.phase) {
        return Ok(false);
    }
    rec.anomaly_overrides.push(ov);
    Ok(true)
}

pub fn apply_archived(rec: &mut BatchRecord) -> Result<(), StateStoreError> {
    let batch = rec.seq;
    if !rec.state.can_transition_to(BatchState::Archived) {
        return Err(StateStoreError::transition(
            batch,
            format!("cannot archive a batch in state {}; only COMPLETE", rec.state),
        ));
    }
    if let Some(first) = rec.missing_parts().first() {
        return Err(StateStoreError::transition(
            batch,
            format!("cannot archive with unsubmitted part {first}"),
        ));
    }
    for part in &mut rec.parts {
        part.archived = true;
        part.external_archive_pending = true;
    }
    rec.state = BatchState::Archived;
    Ok(())
}

pub fn apply_external_confirmed(
    rec: &mut BatchRecord,
    jobs: &[JobId],
) -> Result<(), StateStoreError> {
    if rec.state != BatchState::Archived {
        return Err(StateStoreError::transition(
            rec.seq,
            format!("external archive confirmed while batch is {}", rec.state),
        ));
    }
    for part in rec.parts.iter_mut().filter(|p| jobs.contains(&p.job_id)) {
        part.external_archive_pending = false;
    }
    Ok(())
}
