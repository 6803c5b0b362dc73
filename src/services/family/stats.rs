//! Per-member rollups derived from the family dataset.

use crate::services::family::model::FamilyData;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Cache key the member rollups are stored under
pub const MEMBER_STATS_KEY: &str = "member_stats";

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStats {
    pub member_id: String,
    pub name: String,
    pub open_todos: usize,
    pub completed_todos: usize,
    pub upcoming_events: usize,
}

/// Compute rollups for every member, in member order
pub fn member_stats(data: &FamilyData, now: DateTime<Utc>) -> Vec<MemberStats> {
    data.members
        .iter()
        .map(|member| {
            let assigned = data
                .todos
                .iter()
                .filter(|todo| todo.assignee.as_deref() == Some(member.id.as_str()));
            let (completed, open): (Vec<_>, Vec<_>) = assigned.partition(|todo| todo.completed);

            let upcoming_events = data
                .events
                .iter()
                .filter(|event| event.attendees.iter().any(|id| id == &member.id))
                .filter(|event| event.starts_at.map_or(false, |start| start >= now))
                .count();

            MemberStats {
                member_id: member.id.clone(),
                name: member.name.clone(),
                open_todos: open.len(),
                completed_todos: completed.len(),
                upcoming_events,
            }
        })
        .collect()
}
