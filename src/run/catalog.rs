//! Built-in step catalogs, keyed by platform identifier.
//!
//! The client agent pulls its per-participant step list from here (via the
//! gateway) keyed by `(participant_key, platform)`.

use super::model::{Step, SubUnit};

/// Platforms with a built-in catalog.
pub const PLATFORMS: &[&str] = &["jira", "gcp_storage"];

/// Human-readable catalog name for a platform.
pub fn catalog_name(platform: &str) -> Option<&'static str> {
    match platform {
        "jira" => Some("Jira Account Setup"),
        "gcp_storage" => Some("GCP Cloud Storage Setup"),
        _ => None,
    }
}

/// The ordered steps for a platform, in their initial (all-pending) state.
/// Returns `None` for an unknown platform.
pub fn steps_for(platform: &str) -> Option<Vec<Step>> {
    match platform {
        "jira" => Some(jira_steps()),
        "gcp_storage" => Some(gcp_storage_steps()),
        _ => None,
    }
}

fn kw(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_string()).collect()
}

fn field(name: &str, keywords: &[&str]) -> SubUnit {
    SubUnit::new(format!("Fill in the {name} field"), kw(keywords))
}

fn jira_steps() -> Vec<Step> {
    vec![
        Step::new(
            1,
            0,
            "Navigate to Jira signup page",
            kw(&["jira", "sign up", "create account", "atlassian"]),
            Vec::new(),
        ),
        Step::new(
            2,
            1,
            "Enter valid email address",
            kw(&["email", "work email", "@"]),
            vec![field("email", &["email", "@"])],
        ),
        Step::new(
            3,
            2,
            "Create a strong password",
            kw(&["password", "create password", "confirm password"]),
            vec![field("password", &["password"])],
        ),
        Step::new(
            4,
            3,
            "Enter full name",
            kw(&["name", "full name", "first name", "last name"]),
            vec![field("name", &["name"])],
        ),
        Step::new(
            5,
            4,
            "Accept terms and conditions",
            kw(&["terms", "conditions", "agree", "accept"]),
            vec![field("terms", &["terms", "agree", "accept"])],
        ),
        Step::new(
            6,
            5,
            "Verify email address",
            kw(&["verify", "verification", "confirm email", "check email"]),
            Vec::new(),
        ),
        Step::new(
            7,
            6,
            "Complete account setup",
            kw(&["complete", "finish", "done", "success"]),
            Vec::new(),
        ),
    ]
}

fn gcp_storage_steps() -> Vec<Step> {
    vec![
        Step::new(
            1,
            0,
            "Navigate to Cloud Storage in GCP Console",
            kw(&["cloud storage", "storage", "buckets", "navigation menu"]),
            Vec::new(),
        ),
        Step::new(
            2,
            1,
            "Click 'Create Bucket' button",
            kw(&["create", "create bucket", "new bucket", "button"]),
            Vec::new(),
        ),
        Step::new(
            3,
            2,
            "Enter a unique bucket name",
            kw(&["name", "bucket name", "globally unique"]),
            vec![field("bucket name", &["bucket name", "bucket"])],
        ),
        Step::new(
            4,
            3,
            "Choose location type and region",
            kw(&["location", "region", "multi-region", "dual-region"]),
            vec![field("location", &["location", "region"])],
        ),
        Step::new(
            5,
            4,
            "Select storage class",
            kw(&["storage class", "standard", "nearline", "coldline", "archive"]),
            vec![field("storage class", &["storage class", "class"])],
        ),
        Step::new(
            6,
            5,
            "Configure access control",
            kw(&["access control", "uniform", "fine-grained", "permissions"]),
            vec![field("access control", &["access control", "permissions"])],
        ),
        Step::new(
            7,
            6,
            "Review and create bucket",
            kw(&["create", "confirm", "review", "finish"]),
            Vec::new(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::model::StepStatus;

    #[test]
    fn known_platforms_have_steps() {
        for platform in PLATFORMS {
            let steps = steps_for(platform).unwrap();
            assert!(!steps.is_empty(), "{platform} catalog is empty");
            assert!(catalog_name(platform).is_some());
            // Ordinals are dense and ordered, all steps start pending.
            for (i, step) in steps.iter().enumerate() {
                assert_eq!(step.ordinal as usize, i);
                assert_eq!(step.status, StepStatus::Pending);
            }
        }
    }

    #[test]
    fn unknown_platform_is_none() {
        assert!(steps_for("salesforce").is_none());
        assert!(catalog_name("salesforce").is_none());
    }
}
