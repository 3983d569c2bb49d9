use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use super::repo_types::{Course, CourseStatus, Section};
use crate::error::FieldError;

pub const CATEGORIES: &[&str] = &[
    "Web Development",
    "Mobile Development",
    "Data Science",
    "Machine Learning",
    "Design",
    "Business",
    "Marketing",
    "Photography",
    "Music",
    "Language",
    "Other",
];

pub const LEVELS: &[&str] = &["Beginner", "Intermediate", "Advanced", "All Levels"];

/// URL slug for a title: lowercase ASCII alphanumerics, whitespace runs become `-`.
pub fn slugify(title: &str) -> String {
    lazy_static! {
        static ref STRIP_RE: Regex = Regex::new(r"[^a-zA-Z0-9\s]").unwrap();
        static ref SPACE_RE: Regex = Regex::new(r"\s+").unwrap();
    }
    let lower = title.to_lowercase();
    let stripped = STRIP_RE.replace_all(lower.trim(), "");
    let slug = SPACE_RE.replace_all(stripped.trim(), "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "course".to_string()
    } else {
        slug.to_string()
    }
}

/// `base`, then `base-2`, `base-3`, ... for collision attempts.
pub fn slug_candidate(base: &str, attempt: u32) -> String {
    if attempt <= 1 {
        base.to_string()
    } else {
        format!("{base}-{attempt}")
    }
}

pub fn total_lectures(curriculum: &[Section]) -> usize {
    curriculum.iter().map(|s| s.lectures.len()).sum()
}

pub fn discount_percentage(current: f64, original: Option<f64>) -> i32 {
    match original {
        Some(original) if original > current && original > 0.0 => {
            (((original - current) / original) * 100.0).round() as i32
        }
        _ => 0,
    }
}

pub fn has_capacity(enrollment_count: i32, max_enrollment: Option<i32>) -> bool {
    max_enrollment.map_or(true, |max| enrollment_count < max)
}

pub fn is_enrollment_open(course: &Course) -> bool {
    course.status == CourseStatus::Published
        && has_capacity(course.enrollment_count, course.max_enrollment)
}

/// Gives every lecture without an id a fresh one.
pub fn assign_lecture_ids(mut curriculum: Vec<Section>) -> Vec<Section> {
    for lecture in curriculum.iter_mut().flat_map(|s| s.lectures.iter_mut()) {
        if lecture.id.trim().is_empty() {
            lecture.id = Uuid::new_v4().to_string();
        }
    }
    curriculum
}

pub fn check_catalog_fields(
    category: Option<&str>,
    level: Option<&str>,
    price_current: Option<f64>,
    price_original: Option<f64>,
) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if let Some(c) = category {
        if !CATEGORIES.contains(&c) {
            errors.push(FieldError::new("category", "Unknown course category"));
        }
    }
    if let Some(l) = level {
        if !LEVELS.contains(&l) {
            errors.push(FieldError::new("level", "Unknown course level"));
        }
    }
    if price_current.map_or(false, |p| p < 0.0 || !p.is_finite()) {
        errors.push(FieldError::new("price.current", "Price cannot be negative"));
    }
    if price_original.map_or(false, |p| p < 0.0 || !p.is_finite()) {
        errors.push(FieldError::new("price.original", "Original price cannot be negative"));
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::courses::repo_types::Lecture;

    fn lecture(id: &str) -> Lecture {
        Lecture {
            id: id.into(),
            title: "L".into(),
            duration: 5.0,
            video: None,
            resources: vec![],
            is_free: false,
        }
    }

    #[test]
    fn slug_strips_punctuation_and_collapses_spaces() {
        assert_eq!(slugify("Rust for  Beginners!"), "rust-for-beginners");
        assert_eq!(slugify("  C++ & Systems   Programming "), "c-systems-programming");
        assert_eq!(slugify("¡¡¡"), "course");
    }

    #[test]
    fn slug_candidates_suffix_from_two() {
        assert_eq!(slug_candidate("rust", 1), "rust");
        assert_eq!(slug_candidate("rust", 2), "rust-2");
    }

    #[test]
    fn lecture_total_spans_sections() {
        let curriculum = vec![
            Section {
                title: "A".into(),
                lectures: (0..4).map(|i| lecture(&i.to_string())).collect(),
            },
            Section {
                title: "B".into(),
                lectures: (4..10).map(|i| lecture(&i.to_string())).collect(),
            },
        ];
        assert_eq!(total_lectures(&curriculum), 10);
    }

    #[test]
    fn discount_only_when_original_is_higher() {
        assert_eq!(discount_percentage(50.0, Some(200.0)), 75);
        assert_eq!(discount_percentage(66.0, Some(99.0)), 33);
        assert_eq!(discount_percentage(100.0, Some(80.0)), 0);
        assert_eq!(discount_percentage(100.0, None), 0);
    }

    #[test]
    fn capacity() {
        assert!(has_capacity(10, None));
        assert!(has_capacity(9, Some(10)));
        assert!(!has_capacity(10, Some(10)));
    }

    #[test]
    fn missing_lecture_ids_are_generated() {
        let curriculum = assign_lecture_ids(vec![Section {
            title: "A".into(),
            lectures: vec![lecture(""), lecture("keep")],
        }]);
        assert!(!curriculum[0].lectures[0].id.is_empty());
        assert_eq!(curriculum[0].lectures[1].id, "keep");
    }

    #[test]
    fn catalog_field_checks() {
        assert!(check_catalog_fields(Some("Design"), Some("Beginner"), Some(0.0), None).is_empty());
        let errs = check_catalog_fields(Some("Cooking"), Some("Expert"), Some(-1.0), None);
        let fields: Vec<_> = errs.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, ["category", "level", "price.current"]);
    }
}
