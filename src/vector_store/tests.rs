use super::*;

#[test]
fn cosine_similarity_of_identical_vectors_is_one() {
    let v = vec![0.3, -0.5, 0.8, 0.1];
    let score = cosine_similarity(&v, &v);
    assert!((score - 1.0).abs() < 1e-6);
}

#[test]
fn cosine_similarity_is_symmetric() {
    let a = vec![1.0, 2.0, 3.0];
    let b = vec![-2.0, 0.5, 1.5];
    assert!((cosine_similarity(&a, &b) - cosine_similarity(&b, &a)).abs() < 1e-6);
}

#[test]
fn cosine_similarity_of_orthogonal_vectors_is_zero() {
    let a = vec![1.0, 0.0];
    let b = vec![0.0, 1.0];
    assert!(cosine_similarity(&a, &b).abs() < 1e-6);
}

#[test]
fn cosine_similarity_handles_zero_norm() {
    let zero = vec![0.0, 0.0, 0.0];
    let v = vec![1.0, 2.0, 3.0];
    assert_eq!(cosine_similarity(&zero, &v), 0.0);
    assert_eq!(cosine_similarity(&v, &zero), 0.0);
    assert_eq!(cosine_similarity(&[], &[]), 0.0);
}

#[test]
fn cosine_similarity_rejects_mismatched_lengths() {
    assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
}

#[test]
fn format_bytes_scales_units() {
    assert_eq!(format_bytes(0), "0 B");
    assert_eq!(format_bytes(512), "512 B");
    assert_eq!(format_bytes(2048), "2.00 KB");
    assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
}

#[test]
fn filter_matches_exact_and_set_membership() {
    let mut metadata = BTreeMap::new();
    metadata.insert(
        "course_namespace".to_string(),
        Value::String("history_101".to_string()),
    );

    assert!(Filter::eq("course_namespace", "history_101").matches(&metadata));
    assert!(!Filter::eq("course_namespace", "biology_202").matches(&metadata));

    assert!(
        Filter::any_of(
            "course_namespace",
            vec!["biology_202".to_string(), "history_101".to_string()],
        )
        .matches(&metadata)
    );
    assert!(!Filter::any_of("course_namespace", vec![]).matches(&metadata));
    assert!(!Filter::eq("missing_field", "anything").matches(&metadata));
}
