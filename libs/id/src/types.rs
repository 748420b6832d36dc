//! ID definitions.

use crate::define_id;

define_id!(
    /// Identifies one action request and the single result emitted for it.
    ActionId,
    "act"
);

define_id!(
    /// Correlates a perception request with its result.
    RequestId,
    "req"
);

define_id!(
    /// Identifies the active handle of a started sandbox backend.
    SandboxId,
    "sbx"
);

define_id!(
    /// Identifies one agent episode (one run of the state machine).
    EpisodeId,
    "ep"
);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_action_id_roundtrip() {
        let id = ActionId::new();
        let parsed: ActionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("act_"));
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        let err = "req_01HV4Z2WQXKJNM8GPQY6VBKC3D"
            .parse::<ActionId>()
            .unwrap_err();
        assert!(matches!(err, crate::IdError::WrongKind { expected: "act", .. }));
    }

    #[test]
    fn test_missing_separator() {
        let err = "sbx01HV4Z2WQXKJNM8GPQY6VBKC3D"
            .parse::<SandboxId>()
            .unwrap_err();
        assert!(matches!(err, crate::IdError::WrongKind { .. }));
    }

    #[test]
    fn test_empty_and_bad_ulid() {
        assert_eq!("".parse::<EpisodeId>().unwrap_err(), crate::IdError::Empty);
        assert!(matches!(
            "ep_nope".parse::<EpisodeId>().unwrap_err(),
            crate::IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_json_is_plain_string() {
        let id = SandboxId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: SandboxId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let first = RequestId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = RequestId::new();
        assert!(first < second);
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [
            ActionId::PREFIX,
            RequestId::PREFIX,
            SandboxId::PREFIX,
            EpisodeId::PREFIX,
        ];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn prop_foreign_prefix_never_parses(prefix in "[a-z]{1,6}") {
            prop_assume!(prefix != ActionId::PREFIX);
            let raw = format!("{prefix}_{}", crate::Ulid::new());
            prop_assert!(raw.parse::<ActionId>().is_err());
        }
    }
}
