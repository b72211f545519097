//! Small helpers over kube-rs types shared by the controllers

use std::collections::BTreeMap;

use kube::api::ObjectMeta;

/// True when the API server answered 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True when the API server rejected a write because of a stale resourceVersion
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// True for errors that a later attempt can succeed on
///
/// 4xx responses are permanent except conflicts, which clear after a fresh read.
pub fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => ae.code == 409 || !(400..500).contains(&ae.code),
        _ => true,
    }
}

/// Map a 404 to `None` so lookups can branch on absence
pub fn not_found_to_none<T>(result: Result<T, kube::Error>) -> Result<Option<T>, kube::Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check whether the object carries the given finalizer
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Append the finalizer in place; returns false if it was already present
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Drop the finalizer in place; returns false if it was not present
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

/// Owner labels overlaid with the operator's managed-by label
pub fn managed_labels(
    owner_labels: Option<&BTreeMap<String, String>>,
    owner_name: &str,
) -> BTreeMap<String, String> {
    let mut labels = owner_labels.cloned().unwrap_or_default();
    labels.insert(crate::MANAGED_BY_LABEL.to_string(), owner_name.to_string());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_not_found_maps_to_none() {
        let res: Result<u8, _> = Err(api_error(404));
        assert!(matches!(not_found_to_none(res), Ok(None)));

        let res: Result<u8, _> = Ok(7);
        assert!(matches!(not_found_to_none(res), Ok(Some(7))));

        let res: Result<u8, _> = Err(api_error(500));
        assert!(not_found_to_none(res).is_err());
    }

    #[test]
    fn test_status_code_classification() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(is_conflict(&api_error(409)));
        assert!(is_transient(&api_error(409)));
        assert!(is_transient(&api_error(502)));
        assert!(!is_transient(&api_error(403)));
    }

    #[test]
    fn test_finalizer_add_is_idempotent() {
        let mut meta = ObjectMeta::default();
        assert!(add_finalizer(&mut meta, "x/y"));
        assert!(!add_finalizer(&mut meta, "x/y"));
        assert_eq!(meta.finalizers, Some(vec!["x/y".to_string()]));
        assert!(has_finalizer(&meta, "x/y"));
    }

    #[test]
    fn test_finalizer_remove_keeps_others() {
        let mut meta = ObjectMeta {
            finalizers: Some(vec!["other".to_string(), "x/y".to_string()]),
            ..Default::default()
        };
        assert!(remove_finalizer(&mut meta, "x/y"));
        assert!(!remove_finalizer(&mut meta, "x/y"));
        assert_eq!(meta.finalizers, Some(vec!["other".to_string()]));
        assert!(!remove_finalizer(&mut ObjectMeta::default(), "x/y"));
    }

    #[test]
    fn test_managed_label_overrides_owner_value() {
        let owner = BTreeMap::from([
            ("app".to_string(), "web".to_string()),
            (crate::MANAGED_BY_LABEL.to_string(), "spoofed".to_string()),
        ]);
        let labels = managed_labels(Some(&owner), "web-tunnel");
        assert_eq!(labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(
            labels.get(crate::MANAGED_BY_LABEL).map(String::as_str),
            Some("web-tunnel")
        );
        assert_eq!(managed_labels(None, "t").len(), 1);
    }
}
