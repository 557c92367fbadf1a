/// Attendance status values recognised by the application.
///
/// The store keeps the status as free text and performs no enum validation,
/// so the closed set lives here and stored values are checked against it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Holiday,
}

impl AttendanceStatus {
    pub const ALL: [AttendanceStatus; 3] = [
        AttendanceStatus::Present,
        AttendanceStatus::Absent,
        AttendanceStatus::Holiday,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Holiday => "holiday",
        }
    }

    pub fn allowed_values() -> Vec<String> {
        Self::ALL.iter().map(|s| s.as_str().to_owned()).collect()
    }
}

/// Case-insensitive membership test shared by every value domain in a plan.
pub fn is_recognized(allowed: &[String], value: &str) -> bool {
    let value = value.trim();
    allowed.iter().any(|a| a.eq_ignore_ascii_case(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_values_are_lowercase_names() {
        assert_eq!(AttendanceStatus::allowed_values(), vec!["present", "absent", "holiday"]);
    }

    #[test]
    fn test_is_recognized() {
        let allowed = AttendanceStatus::allowed_values();
        assert!(is_recognized(&allowed, "HOLIDAY"));
        assert!(is_recognized(&allowed, "absent"));
        assert!(!is_recognized(&allowed, "excused"));
    }
}
