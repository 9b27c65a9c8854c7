use crate::model::*;

/// Proposals for a slot freed on `resources`, FIFO by requested date then
/// creation order.
///
/// An entry matches when it is still waiting, lists one of `resources` among
/// its candidates, and the freed interval leaves at least its requested
/// duration inside the preferred window widened by the flexibility days. An
/// entry yields at most one proposal, naming the first of its candidates in
/// lock order. Nothing is mutated, so repeated calls over the same entries
/// give the same answer.
pub fn match_waitlist<'a>(
    entries: impl IntoIterator<Item = &'a WaitlistEntry>,
    resources: &[ResourceKey],
    freed: &Span,
) -> Vec<WaitlistMatchProposal> {
    let mut freed_on = resources.to_vec();
    freed_on.sort();

    let mut hits: Vec<(&WaitlistEntry, ResourceKey, Span)> = entries
        .into_iter()
        .filter(|e| e.status == WaitlistStatus::Waiting)
        .filter_map(|e| {
            let resource = freed_on.iter().find(|r| e.candidates.contains(*r))?;
            let overlap = e.acceptable_span()?.intersection(freed)?;
            (overlap.duration_ms() >= e.duration_minutes as Ms * MINUTE_MS).then_some((e, *resource, overlap))
        })
        .collect();

    hits.sort_by_key(|(e, _, _)| (e.requested_date, e.created_at, e.id));

    hits.into_iter()
        .map(|(e, resource, interval)| WaitlistMatchProposal {
            entry_id: e.id,
            user_id: e.user_id,
            resource,
            interval,
        })
        .collect()
}
