use crate::model::*;

// ── Interval set algebra ──────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Sort then merge an arbitrary collection of spans.
pub fn normalize(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by_key(|s| (s.start, s.end));
    merge_overlapping(&spans)
}

/// Subtract `to_remove` from `base`. Both inputs must be sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Free remainder of `base` once every `blocked` span is removed.
/// `blocked` may be unsorted and overlapping.
pub fn subtract(base: Span, blocked: &[Span]) -> Vec<Span> {
    let blocked = normalize(blocked.to_vec());
    subtract_intervals(&[base], &blocked)
}

/// Sweep-line algorithm: find time ranges where allocation count >= capacity.
/// Returns sorted, merged spans representing fully-saturated time ranges.
pub fn compute_saturated_spans(allocs: &[Span], capacity: u32) -> Vec<Span> {
    if allocs.is_empty() || capacity == 0 {
        return Vec::new();
    }
    if capacity == 1 {
        return normalize(allocs.to_vec());
    }

    // +1 at start, -1 at end; ends sort before starts at the same instant
    let mut events: Vec<(Ms, i32)> = Vec::with_capacity(allocs.len() * 2);
    for a in allocs {
        events.push((a.start, 1));
        events.push((a.end, -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result = Vec::new();
    let mut count: u32 = 0;
    let mut saturated_start: Option<Ms> = None;

    for (time, delta) in &events {
        if *delta > 0 {
            count += 1;
        } else {
            count -= 1;
        }

        if count >= capacity && saturated_start.is_none() {
            saturated_start = Some(*time);
        } else if count < capacity
            && let Some(start) = saturated_start.take()
            && *time > start {
                result.push(Span::new(start, *time));
            }
    }

    merge_overlapping(&result)
}

// ── Resolver ──────────────────────────────────────────────────────

/// Blocked sub-intervals of `window` for one resource: unavailable windows plus
/// the time where live bookings fill the resource's capacity. Sorted, disjoint,
/// clamped to `window`.
pub fn resolve_blocked(resource: &ResourceState, window: &Span) -> Vec<Span> {
    let mut unavailable = Vec::new();
    let mut occupied = Vec::new();

    for interval in resource.overlapping(window) {
        let Some(clamped) = interval.span.intersection(window) else {
            continue;
        };
        match interval.kind {
            IntervalKind::Unavailable => unavailable.push(clamped),
            IntervalKind::Booking => occupied.push(clamped),
            IntervalKind::Available => {}
        }
    }

    unavailable.extend(compute_saturated_spans(&occupied, resource.capacity));
    normalize(unavailable)
}

/// Net free time of `window` for one resource.
pub fn free_within(resource: &ResourceState, window: &Span) -> Vec<Span> {
    let blocked = resolve_blocked(resource, window);
    subtract_intervals(&[*window], &blocked)
}
