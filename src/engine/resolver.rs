use chrono::{Days, LocalResult, NaiveDate, NaiveTime, TimeDelta, TimeZone};
use chrono_tz::Tz;
use ulid::Ulid;

use super::EngineError;
use crate::model::{ClinicianState, Exclusion, Ms, Span};

/// Why a window cannot be booked. Checked in this order; first match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowBlock {
    ClinicClosed(String),
    ResourceUnavailable(String),
    TimeConflict(Ulid),
}

impl From<WindowBlock> for EngineError {
    fn from(block: WindowBlock) -> Self {
        match block {
            WindowBlock::ClinicClosed(reason) => EngineError::ClinicClosed(reason),
            WindowBlock::ResourceUnavailable(reason) => EngineError::ResourceUnavailable(reason),
            WindowBlock::TimeConflict(_) => EngineError::SlotTaken,
        }
    }
}

/// Local wall-clock time on `date` in `zone`, as UTC milliseconds.
/// A time repeated by a DST fold resolves to its first occurrence; a time
/// skipped by a DST gap is shifted forward one hour.
pub fn to_utc(zone: Tz, date: NaiveDate, time: NaiveTime) -> Ms {
    let local = date.and_time(time);
    match zone.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.timestamp_millis(),
        LocalResult::Ambiguous(first, _) => first.timestamp_millis(),
        LocalResult::None => match zone.from_local_datetime(&(local + TimeDelta::hours(1))) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.timestamp_millis(),
            LocalResult::None => local.and_utc().timestamp_millis(),
        },
    }
}

/// The UTC interval an exclusion blocks. All-day exclusions cover local
/// midnight to the next local midnight.
fn blocked_span(zone: Tz, ex: &Exclusion) -> Span {
    match ex.window {
        Some((start, end)) => Span {
            start: to_utc(zone, ex.date, start),
            end: to_utc(zone, ex.date, end),
        },
        None => {
            let next = ex.date.checked_add_days(Days::new(1)).unwrap_or(ex.date);
            Span {
                start: to_utc(zone, ex.date, NaiveTime::default()),
                end: to_utc(zone, next, NaiveTime::default()),
            }
        }
    }
}

/// Local calendar dates a window touches, padded by one day either side so
/// offsets near midnight are never missed.
fn touched_dates(zone: Tz, window: &Span) -> Option<(NaiveDate, NaiveDate)> {
    let first = zone.timestamp_millis_opt(window.start).single()?.date_naive();
    let last = zone.timestamp_millis_opt(window.end - 1).single()?.date_naive();
    Some((first.pred_opt()?, last.succ_opt()?))
}

fn blocking<'a>(
    zone: Tz,
    exclusions: &'a [Exclusion],
    window: &Span,
) -> Option<&'a Exclusion> {
    let dates = touched_dates(zone, window);
    exclusions
        .iter()
        .filter(|ex| dates.is_none_or(|(lo, hi)| ex.date >= lo && ex.date <= hi))
        .find(|ex| {
            let span = blocked_span(zone, ex);
            span.start < span.end && span.overlaps(window)
        })
}

/// Can `clinician` take `window`? Team closures first, then the clinician's
/// own exclusions, then their non-cancelled appointments. `ignore` skips one
/// appointment, used when restoring it.
pub fn check_window(
    zone: Tz,
    closures: &[Exclusion],
    clinician: &ClinicianState,
    window: &Span,
    ignore: Option<Ulid>,
) -> Result<(), WindowBlock> {
    if let Some(ex) = blocking(zone, closures, window) {
        return Err(WindowBlock::ClinicClosed(ex.label()));
    }
    if let Some(ex) = blocking(zone, &clinician.exclusions, window) {
        return Err(WindowBlock::ResourceUnavailable(ex.label()));
    }
    if let Some(appt) = clinician
        .overlapping(window)
        .find(|a| a.status.is_active() && Some(a.id) != ignore)
    {
        return Err(WindowBlock::TimeConflict(appt.id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    const SGT: Tz = chrono_tz::Asia::Singapore;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn local(d: NaiveDate, h: u32, m: u32) -> Ms {
        to_utc(SGT, d, hm(h, m))
    }

    fn exclusion(d: NaiveDate, window: Option<(NaiveTime, NaiveTime)>, reason: &str) -> Exclusion {
        Exclusion {
            id: Ulid::new(),
            date: d,
            window,
            reason: Some(reason.into()),
            kind: ExclusionKind::Other,
        }
    }

    fn clinician() -> ClinicianState {
        ClinicianState::new(Clinician { id: Ulid::new(), name: "Dr. Tan".into() })
    }

    fn appointment(cs: &ClinicianState, span: Span, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            clinician_id: cs.clinician.id,
            span,
            appointment_type_id: Ulid::nil(),
            pet_name: "Milo".into(),
            client: Holder {
                name: "Kim".into(),
                email: "kim@example.com".into(),
                phone: None,
                user_id: None,
            },
            notes: None,
            status,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn singapore_is_utc_plus_eight() {
        let d = date(2025, 6, 2);
        assert_eq!(
            local(d, 8, 0),
            d.and_time(hm(0, 0)).and_utc().timestamp_millis()
        );
    }

    #[test]
    fn all_day_closure_blocks() {
        let d = date(2025, 12, 25);
        let closures = vec![exclusion(d, None, "Christmas")];
        let window = Span::new(local(d, 14, 0), local(d, 14, 30));
        assert_eq!(
            check_window(SGT, &closures, &clinician(), &window, None),
            Err(WindowBlock::ClinicClosed("Christmas".into()))
        );

        let next_day = date(2025, 12, 26);
        let window = Span::new(local(next_day, 9, 0), local(next_day, 9, 30));
        assert!(check_window(SGT, &closures, &clinician(), &window, None).is_ok());
    }

    #[test]
    fn partial_closure_is_half_open() {
        let d = date(2025, 3, 3);
        let closures = vec![exclusion(d, Some((hm(12, 0), hm(13, 0))), "Staff meeting")];
        let cs = clinician();

        let touching = Span::new(local(d, 13, 0), local(d, 13, 30));
        assert!(check_window(SGT, &closures, &cs, &touching, None).is_ok());

        let inside = Span::new(local(d, 12, 30), local(d, 13, 30));
        assert!(matches!(
            check_window(SGT, &closures, &cs, &inside, None),
            Err(WindowBlock::ClinicClosed(_))
        ));
    }

    #[test]
    fn closures_checked_before_slot_exclusions() {
        let d = date(2025, 3, 4);
        let closures = vec![exclusion(d, Some((hm(9, 0), hm(10, 0))), "Maintenance")];
        let mut cs = clinician();
        cs.exclusions.push(exclusion(d, None, "Vacation"));

        let window = Span::new(local(d, 9, 30), local(d, 10, 30));
        assert_eq!(
            check_window(SGT, &closures, &cs, &window, None),
            Err(WindowBlock::ClinicClosed("Maintenance".into()))
        );

        let later = Span::new(local(d, 15, 0), local(d, 15, 30));
        assert_eq!(
            check_window(SGT, &closures, &cs, &later, None),
            Err(WindowBlock::ResourceUnavailable("Vacation".into()))
        );
    }

    #[test]
    fn appointment_overlap_and_adjacency() {
        let d = date(2025, 3, 5);
        let mut cs = clinician();
        let existing = appointment(&cs, Span::new(local(d, 10, 0), local(d, 11, 0)), AppointmentStatus::Scheduled);
        let existing_id = existing.id;
        cs.insert_appointment(existing);

        let overlap = Span::new(local(d, 10, 30), local(d, 11, 30));
        assert_eq!(
            check_window(SGT, &[], &cs, &overlap, None),
            Err(WindowBlock::TimeConflict(existing_id))
        );
        assert!(check_window(SGT, &[], &cs, &overlap, Some(existing_id)).is_ok());

        let adjacent = Span::new(local(d, 11, 0), local(d, 12, 0));
        assert!(check_window(SGT, &[], &cs, &adjacent, None).is_ok());
    }

    #[test]
    fn cancelled_appointments_do_not_block() {
        let d = date(2025, 3, 6);
        let mut cs = clinician();
        let span = Span::new(local(d, 10, 0), local(d, 11, 0));
        cs.insert_appointment(appointment(&cs, span, AppointmentStatus::Cancelled));
        assert!(check_window(SGT, &[], &cs, &span, None).is_ok());
    }

    #[test]
    fn window_crossing_midnight_sees_both_dates() {
        let d1 = date(2025, 3, 7);
        let d2 = date(2025, 3, 8);
        let closures = vec![exclusion(d2, Some((hm(0, 0), hm(1, 0))), "Overnight works")];
        let window = Span::new(local(d1, 23, 30), local(d2, 0, 30));
        assert!(matches!(
            check_window(SGT, &closures, &clinician(), &window, None),
            Err(WindowBlock::ClinicClosed(_))
        ));
    }

    #[test]
    fn dst_gap_shifts_forward() {
        let ny = chrono_tz::America::New_York;
        // 2025-03-09 02:30 does not exist in New York.
        let d = date(2025, 3, 9);
        assert_eq!(to_utc(ny, d, hm(2, 30)), to_utc(ny, d, hm(3, 30)));
    }

    #[test]
    fn time_conflict_maps_to_slot_taken() {
        let err: EngineError = WindowBlock::TimeConflict(Ulid::new()).into();
        assert_eq!(err, EngineError::SlotTaken);
    }
}
