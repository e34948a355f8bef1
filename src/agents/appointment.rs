//! The appointment booking state machine.
//!
//! A single booking moves GATHERING → VALIDATING → CONFIRMING →
//! COMMITTED | FAILED within a turn. Missing fields end the turn with a
//! clarification; the next turn resumes gathering from history. A slot
//! conflict drops back to gathering with proposed alternatives. The
//! confirmation message is only ever composed after the store insert
//! succeeds, so a claimed booking always exists.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Timelike, Weekday};
use regex::Regex;
use uuid::Uuid;

use super::{Agent, AgentError};
use crate::db::{AppointmentStore, DatabaseError};
use crate::lang::Lang;
use crate::models::{AgentName, AppointmentRequest, Role, TurnState};

/// Validation attempts per session before escalating.
const MAX_ATTEMPTS: u32 = 3;

/// Alternative slots proposed on a conflict.
const ALTERNATIVES_SHOWN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Gathering,
    Validating,
    Confirming,
    Committed,
    Failed,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Gathering => "gathering",
            Self::Validating => "validating",
            Self::Confirming => "confirming",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }
}

static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bname\s+(?:is\s+)?|\btên\s+(?:là\s+|tôi\s+là\s+)?)([^\n,;.]+)").unwrap()
});

static PHONE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0\d{8,10}\b").unwrap());

static REASON_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\breason\s*:?\s+|\blý\s+do\s*:?\s+)([^\n,;.]+)").unwrap()
});

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap());

static SLASH_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})(?:/(\d{4}))?\b").unwrap());

static CLOCK_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b|\b(\d{1,2}):(\d{2})\b").unwrap()
});

static VI_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})\s*giờ(?:\s*(\d{2}))?\s*(sáng|chiều|tối)?").unwrap()
});

static WEEKDAY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(monday|tuesday|wednesday|thursday|friday|saturday|sunday|mon|tue|wed|thu|fri|sat|sun)\b|(thứ\s+(?:hai|ba|tư|năm|sáu|bảy)|chủ\s+nhật)",
    )
    .unwrap()
});

fn weekday_from_mention(mention: &str) -> Option<Weekday> {
    let normalized = mention.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    match normalized.as_str() {
        "monday" | "mon" | "thứ hai" => Some(Weekday::Mon),
        "tuesday" | "tue" | "thứ ba" => Some(Weekday::Tue),
        "wednesday" | "wed" | "thứ tư" => Some(Weekday::Wed),
        "thursday" | "thu" | "thứ năm" => Some(Weekday::Thu),
        "friday" | "fri" | "thứ sáu" => Some(Weekday::Fri),
        "saturday" | "sat" | "thứ bảy" => Some(Weekday::Sat),
        "sunday" | "sun" | "chủ nhật" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Fields recovered from the conversation so far.
#[derive(Debug, Default, Clone)]
struct GatheredFields {
    patient_name: Option<String>,
    phone: Option<String>,
    reason: Option<String>,
    date: Option<NaiveDate>,
    time: Option<NaiveTime>,
    provider: Option<String>,
}

pub struct AppointmentAgent {
    store: Arc<AppointmentStore>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl AppointmentAgent {
    pub fn new(store: Arc<AppointmentStore>) -> Self {
        Self { store, attempts: Mutex::new(HashMap::new()) }
    }

    fn bump_attempts(&self, session_id: &str) -> u32 {
        let mut attempts = self.attempts.lock().expect("attempt counter poisoned");
        let counter = attempts.entry(session_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn clear_attempts(&self, session_id: &str) {
        self.attempts.lock().expect("attempt counter poisoned").remove(session_id);
    }

    /// Parse fields from prior user turns plus the current input; later
    /// mentions win.
    fn gather(&self, state: &TurnState) -> GatheredFields {
        let mut fields = GatheredFields::default();
        let today = chrono::Local::now().date_naive();

        let texts: Vec<&str> = state
            .history
            .iter()
            .filter(|t| t.role == Role::User)
            .map(|t| t.text.as_str())
            .chain(std::iter::once(state.user_input.as_str()))
            .collect();

        for text in texts {
            if let Some(cap) = NAME_PATTERN.captures(text) {
                fields.patient_name = Some(cap[1].trim().to_string());
            }
            if let Some(mat) = PHONE_PATTERN.find(text) {
                fields.phone = Some(mat.as_str().to_string());
            }
            if let Some(cap) = REASON_PATTERN.captures(text) {
                fields.reason = Some(cap[1].trim().to_string());
            }
            if let Some(date) = parse_date(text, today) {
                fields.date = Some(date);
            }
            if let Some(time) = parse_time(text) {
                fields.time = Some(time);
            }
            for provider in self.store.profile().providers {
                if text.to_lowercase().contains(&provider.to_lowercase()) {
                    fields.provider = Some(provider.to_string());
                }
            }
        }
        fields
    }

    fn missing_fields(fields: &GatheredFields, lang: Lang) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if fields.patient_name.is_none() {
            missing.push(if lang == Lang::Vi { "họ tên" } else { "your full name" });
        }
        if fields.phone.is_none() {
            missing.push(if lang == Lang::Vi { "số điện thoại" } else { "a phone number" });
        }
        if fields.date.is_none() {
            missing.push(if lang == Lang::Vi { "ngày khám" } else { "a preferred date" });
        }
        if fields.time.is_none() {
            missing.push(if lang == Lang::Vi { "giờ khám" } else { "a preferred time" });
        }
        if fields.reason.is_none() {
            missing.push(if lang == Lang::Vi { "lý do khám" } else { "the reason for the visit" });
        }
        missing
    }

    /// Date/time/phone validation against clinic rules.
    fn validate(&self, fields: &GatheredFields, lang: Lang) -> Result<(), String> {
        let profile = self.store.profile();
        let today = chrono::Local::now().date_naive();
        let date = fields.date.expect("validated after gathering");
        let time = fields.time.expect("validated after gathering");
        let phone = fields.phone.as_deref().expect("validated after gathering");

        if date < today {
            return Err(match lang {
                Lang::Vi => "Không thể đặt lịch trong quá khứ. Vui lòng chọn ngày khác.".into(),
                Lang::En => "Appointments can't be scheduled in the past. Please pick another date.".into(),
            });
        }
        if date > today + Duration::days(profile.max_booking_days_ahead) {
            return Err(match lang {
                Lang::Vi => "Chỉ nhận đặt lịch trong vòng 6 tháng tới.".into(),
                Lang::En => "We only take bookings up to 6 months ahead.".into(),
            });
        }

        let window = match date.weekday() {
            Weekday::Sun => {
                return Err(match lang {
                    Lang::Vi => "Phòng khám nghỉ Chủ nhật. Vui lòng chọn ngày khác.".into(),
                    Lang::En => "The clinic is closed on Sundays. Please pick another day.".into(),
                })
            }
            Weekday::Sat => profile.saturday_hours,
            _ => profile.weekday_hours,
        };

        let minutes = time.hour() * 60 + time.minute();
        if minutes < window.0 * 60 || minutes >= window.1 * 60 {
            return Err(match lang {
                Lang::Vi => format!(
                    "Giờ khám trong khung {}:00-{}:00. Vui lòng chọn giờ khác.",
                    window.0, window.1
                ),
                Lang::En => format!(
                    "Appointments run {}:00-{}:00 that day. Please pick another time.",
                    window.0, window.1
                ),
            });
        }
        if time.minute() % profile.slot_minutes != 0 {
            return Err(match lang {
                Lang::Vi => "Lịch hẹn theo khung 15 phút (ví dụ 9:00, 9:15, 9:30).".into(),
                Lang::En => "Appointments are on 15-minute intervals (e.g. 9:00, 9:15, 9:30).".into(),
            });
        }

        let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
        if !(8..=11).contains(&digits) {
            return Err(match lang {
                Lang::Vi => "Số điện thoại không hợp lệ.".into(),
                Lang::En => "That phone number doesn't look valid.".into(),
            });
        }

        Ok(())
    }

    fn handle_cancel(&self, state: &mut TurnState, id: Uuid) {
        match self.store.cancel(&id) {
            Ok(appt) => {
                state.final_response = match state.lang {
                    Lang::Vi => format!(
                        "Đã hủy lịch hẹn của {} vào {} lúc {}. Hẹn gặp lại bạn!",
                        appt.patient_name,
                        appt.date.format("%Y-%m-%d"),
                        appt.time.format("%H:%M"),
                    ),
                    Lang::En => format!(
                        "Cancelled the appointment for {} on {} at {}. We hope to see you again!",
                        appt.patient_name,
                        appt.date.format("%Y-%m-%d"),
                        appt.time.format("%H:%M"),
                    ),
                };
            }
            Err(DatabaseError::NotFound { .. }) => {
                state.final_response = match state.lang {
                    Lang::Vi => "Tôi không tìm thấy lịch hẹn với mã đó. Vui lòng kiểm tra lại mã."
                        .to_string(),
                    Lang::En => "I couldn't find an appointment with that id. Please double-check it."
                        .to_string(),
                };
            }
            Err(e) => {
                tracing::warn!(error = %e, "Appointment cancellation failed");
                state.final_response = match state.lang {
                    Lang::Vi => "Không thể hủy lịch hẹn này (có thể đã bị hủy trước đó).".to_string(),
                    Lang::En => "That appointment can't be cancelled (it may already be cancelled)."
                        .to_string(),
                };
            }
        }
        state.push_trace(AgentName::Appointment, &format!("cancel flow for {id}"));
    }

    fn escalation(&self, lang: Lang) -> String {
        let phone = self.store.profile().phone;
        match lang {
            Lang::Vi => format!(
                "Tôi chưa thể hoàn tất đặt lịch sau nhiều lần thử. Vui lòng gọi {phone} để \
                 được nhân viên hỗ trợ trực tiếp."
            ),
            Lang::En => format!(
                "I haven't been able to complete the booking after several tries. Please call \
                 {phone} and our staff will arrange it directly."
            ),
        }
    }
}

/// Resolve a date mention to a concrete day; weekdays mean the next
/// occurrence, and a past day/month rolls into the next year.
fn parse_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let lower = text.to_lowercase();

    if lower.contains("today") || lower.contains("hôm nay") {
        return Some(today);
    }
    if lower.contains("tomorrow") || lower.contains("ngày mai") {
        return Some(today + Duration::days(1));
    }

    if let Some(cap) = ISO_DATE.captures(&lower) {
        return NaiveDate::from_ymd_opt(
            cap[1].parse().ok()?,
            cap[2].parse().ok()?,
            cap[3].parse().ok()?,
        );
    }

    if let Some(cap) = WEEKDAY_PATTERN.captures(&lower) {
        let mention = cap.get(1).or_else(|| cap.get(2)).map(|m| m.as_str())?;
        if let Some(weekday) = weekday_from_mention(mention) {
            let mut ahead = (weekday.num_days_from_monday() as i64)
                - (today.weekday().num_days_from_monday() as i64);
            if ahead <= 0 {
                ahead += 7;
            }
            return Some(today + Duration::days(ahead));
        }
    }

    if let Some(cap) = SLASH_DATE.captures(&lower) {
        let day: u32 = cap[1].parse().ok()?;
        let month: u32 = cap[2].parse().ok()?;
        let year: i32 = cap
            .get(3)
            .and_then(|y| y.as_str().parse().ok())
            .unwrap_or(today.year());
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        if cap.get(3).is_none() && date < today {
            return NaiveDate::from_ymd_opt(year + 1, month, day);
        }
        return Some(date);
    }

    None
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    if let Some(cap) = CLOCK_TIME.captures(text) {
        if let Some(hour) = cap.get(1) {
            let mut hour: u32 = hour.as_str().parse().ok()?;
            let minute: u32 = cap.get(2).map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
            let meridiem = cap.get(3).map(|m| m.as_str().to_lowercase());
            match meridiem.as_deref() {
                Some("pm") if hour < 12 => hour += 12,
                Some("am") if hour == 12 => hour = 0,
                _ => {}
            }
            return NaiveTime::from_hms_opt(hour, minute, 0);
        }
        // Bare HH:MM
        let hour: u32 = cap.get(4)?.as_str().parse().ok()?;
        let minute: u32 = cap.get(5)?.as_str().parse().ok()?;
        return NaiveTime::from_hms_opt(hour, minute, 0);
    }

    if let Some(cap) = VI_TIME.captures(text) {
        let mut hour: u32 = cap[1].parse().ok()?;
        let minute: u32 = cap.get(2).map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
        let period = cap.get(3).map(|m| m.as_str().to_lowercase());
        if matches!(period.as_deref(), Some("chiều") | Some("tối")) && hour < 12 {
            hour += 12;
        }
        return NaiveTime::from_hms_opt(hour, minute, 0);
    }

    None
}

impl Agent for AppointmentAgent {
    fn name(&self) -> AgentName {
        AgentName::Appointment
    }

    fn run(&self, state: &mut TurnState) -> Result<(), AgentError> {
        let lang = state.lang;
        let lower = state.user_input.to_lowercase();

        // Cancel/modify flow: the id is the capability.
        if lower.contains("cancel") || lower.contains("hủy") {
            if let Some(mat) = UUID_PATTERN.find(&state.user_input) {
                if let Ok(id) = Uuid::parse_str(mat.as_str()) {
                    self.handle_cancel(state, id);
                    return Ok(());
                }
            }
        }

        let mut phases = vec![Phase::Gathering];
        let fields = self.gather(state);

        let missing = Self::missing_fields(&fields, lang);
        if !missing.is_empty() {
            let attempt = self.bump_attempts(&state.session_id);
            if attempt >= MAX_ATTEMPTS {
                phases.push(Phase::Failed);
                state.final_response = self.escalation(lang);
            } else {
                state.final_response = match lang {
                    Lang::Vi => format!(
                        "Để đặt lịch, tôi cần thêm: {}. Vui lòng bổ sung giúp tôi nhé.",
                        missing.join(", ")
                    ),
                    Lang::En => format!(
                        "To book that, I still need: {}. Could you fill those in?",
                        missing.join(", ")
                    ),
                };
            }
            state.push_trace(
                AgentName::Appointment,
                &format!("{} (missing {})", phase_path(&phases), missing.len()),
            );
            return Ok(());
        }

        phases.push(Phase::Validating);
        if let Err(problem) = self.validate(&fields, lang) {
            let attempt = self.bump_attempts(&state.session_id);
            if attempt >= MAX_ATTEMPTS {
                phases.push(Phase::Failed);
                state.final_response = self.escalation(lang);
            } else {
                state.final_response = problem;
            }
            state.push_trace(
                AgentName::Appointment,
                &format!("{} (validation failed)", phase_path(&phases)),
            );
            return Ok(());
        }

        phases.push(Phase::Confirming);
        let request = AppointmentRequest {
            patient_name: fields.patient_name.clone().expect("gathered"),
            phone: fields.phone.clone().expect("gathered"),
            reason: fields.reason.clone().expect("gathered"),
            date: fields.date.expect("gathered"),
            time: fields.time.expect("gathered"),
            provider: fields.provider.clone(),
        };

        match self.store.create(&request) {
            Ok(appt) => {
                phases.push(Phase::Committed);
                self.clear_attempts(&state.session_id);
                state.final_response = match lang {
                    Lang::Vi => format!(
                        "🎉 Đã đặt lịch thành công!\n\n\
                         - Mã lịch hẹn: {}\n- Tên: {}\n- Ngày: {}\n- Giờ: {}\n- Bác sĩ: {}\n- Lý do: {}\n\n\
                         Giữ mã lịch hẹn để thay đổi hoặc hủy. Hẹn gặp bạn!",
                        appt.id,
                        appt.patient_name,
                        appt.date.format("%Y-%m-%d"),
                        appt.time.format("%H:%M"),
                        appt.provider,
                        appt.reason,
                    ),
                    Lang::En => format!(
                        "🎉 Your appointment is booked!\n\n\
                         - Appointment id: {}\n- Name: {}\n- Date: {}\n- Time: {}\n- Provider: {}\n- Reason: {}\n\n\
                         Keep the id to change or cancel the booking. See you then!",
                        appt.id,
                        appt.patient_name,
                        appt.date.format("%Y-%m-%d"),
                        appt.time.format("%H:%M"),
                        appt.provider,
                        appt.reason,
                    ),
                };
            }
            Err(DatabaseError::SlotConflict { .. }) => {
                // Back to gathering with proposed alternatives.
                phases.push(Phase::Gathering);
                let provider = fields
                    .provider
                    .clone()
                    .unwrap_or_else(|| self.store.profile().providers[0].to_string());
                let alternatives = self
                    .store
                    .available_slots(fields.date.expect("gathered"), &provider)
                    .unwrap_or_default();
                let proposal: Vec<String> = alternatives
                    .iter()
                    .take(ALTERNATIVES_SHOWN)
                    .map(|t| t.format("%H:%M").to_string())
                    .collect();

                state.final_response = if proposal.is_empty() {
                    match lang {
                        Lang::Vi => "Khung giờ đó đã kín và không còn giờ trống trong ngày. \
                                     Vui lòng chọn ngày khác."
                            .to_string(),
                        Lang::En => "That slot is taken and the day is fully booked. \
                                     Please pick another date."
                            .to_string(),
                    }
                } else {
                    match lang {
                        Lang::Vi => format!(
                            "Khung giờ đó đã có người đặt. Các giờ còn trống: {}. \
                             Bạn muốn chọn giờ nào?",
                            proposal.join(", ")
                        ),
                        Lang::En => format!(
                            "That slot is already booked. Free times that day: {}. \
                             Which would you like?",
                            proposal.join(", ")
                        ),
                    }
                };
            }
            Err(e) => return Err(e.into()),
        }

        state.push_trace(AgentName::Appointment, &phase_path(&phases));
        Ok(())
    }
}

fn phase_path(phases: &[Phase]) -> String {
    phases.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(" → ")
}
