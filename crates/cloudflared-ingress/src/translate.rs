//! Ingress to Tunnel translation
//!
//! Pure functions: nothing here reads from or writes to the API server.

use std::collections::BTreeMap;

use cloudflared_common::crd::{
    Tunnel, TunnelConfiguration, TunnelIngressRule, TunnelSpec,
};
use cloudflared_common::kube_utils::managed_labels;
use cloudflared_common::API_GROUP;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, Ingress, IngressBackend, IngressClass, IngressClassParametersReference,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::IngressError;

/// Kind an IngressClass must reference in `spec.parameters`
pub const PARAMETERS_KIND: &str = "TunnelConfiguration";

/// Whether `class` is handled by the controller named `controller_name`
pub fn is_controlled(class: &IngressClass, controller_name: &str) -> bool {
    class
        .spec
        .as_ref()
        .and_then(|s| s.controller.as_deref())
        == Some(controller_name)
}

/// The class parameters, checked to reference a TunnelConfiguration
pub fn tunnel_configuration_ref(
    class: &IngressClass,
) -> Result<&IngressClassParametersReference, IngressError> {
    let params = class
        .spec
        .as_ref()
        .and_then(|s| s.parameters.as_ref())
        .ok_or_else(|| {
            IngressError::invalid_parameters(format!(
                "IngressClass {} has no spec.parameters",
                class.name_any()
            ))
        })?;

    if params.api_group.as_deref() != Some(API_GROUP) || params.kind != PARAMETERS_KIND {
        return Err(IngressError::invalid_parameters(format!(
            "IngressClass {} parameters must reference {}/{}, got {}/{}",
            class.name_any(),
            API_GROUP,
            PARAMETERS_KIND,
            params.api_group.as_deref().unwrap_or_default(),
            params.kind
        )));
    }
    Ok(params)
}

/// Namespace holding the referenced TunnelConfiguration
///
/// Namespace-scoped parameters name their namespace; anything else is looked
/// up next to the Ingress.
pub fn parameters_namespace<'a>(
    params: &'a IngressClassParametersReference,
    ingress_namespace: &'a str,
) -> &'a str {
    match (params.scope.as_deref(), params.namespace.as_deref()) {
        (Some("Namespace"), Some(ns)) => ns,
        _ => ingress_namespace,
    }
}

/// cloudflared service URL for a backend, if it points at a Service
pub fn backend_service(backend: &IngressBackend) -> Option<String> {
    let service = backend.service.as_ref()?;
    let port = service.port.as_ref()?;
    match (port.number, port.name.as_deref()) {
        (Some(number), _) => Some(format!("http://{}:{}", service.name, number)),
        (None, Some(name)) => Some(format!("http://{}:{}", service.name, name)),
        (None, None) => None,
    }
}

fn escape_regex(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// cloudflared path regex for an Ingress path
///
/// A `/` prefix matches everything and needs no regex.
fn path_regex(path: &HTTPIngressPath) -> Option<String> {
    let raw = path.path.as_deref().filter(|p| !p.is_empty())?;
    match path.path_type.as_str() {
        "Exact" => Some(format!("^{}$", escape_regex(raw))),
        "Prefix" if raw == "/" => None,
        "Prefix" => Some(format!("^{}", escape_regex(raw.trim_end_matches('/')))),
        _ => Some(raw.to_string()),
    }
}

/// Tunnel rules for an Ingress, in match order
///
/// Host rules come first in declaration order; the default backend, if any,
/// becomes the trailing catch-all. Backends that are not Services are skipped.
pub fn tunnel_rules(ingress: &Ingress) -> Vec<TunnelIngressRule> {
    let Some(spec) = ingress.spec.as_ref() else {
        return Vec::new();
    };

    let mut rules = Vec::new();
    for rule in spec.rules.iter().flatten() {
        let Some(http) = rule.http.as_ref() else {
            continue;
        };
        for path in &http.paths {
            if let Some(service) = backend_service(&path.backend) {
                rules.push(TunnelIngressRule {
                    hostname: rule.host.clone(),
                    path: path_regex(path),
                    service,
                    origin_request: None,
                });
            }
        }
    }

    if let Some(service) = spec.default_backend.as_ref().and_then(backend_service) {
        rules.push(TunnelIngressRule::catch_all(service));
    }
    rules
}

/// The Tunnel an Ingress should produce
///
/// Shares the Ingress's name, namespace and labels and is controlled by it.
pub fn desired_tunnel(
    ingress: &Ingress,
    config: &TunnelConfiguration,
) -> Result<Tunnel, IngressError> {
    let name = ingress.name_any();
    let namespace = ingress.namespace().ok_or(IngressError::MissingNamespace)?;
    let owner = ingress.controller_owner_ref(&()).ok_or_else(|| {
        cloudflared_common::Error::missing_field("Ingress", name.clone(), "metadata.uid")
    })?;

    let mut tunnel = Tunnel::new(
        &name,
        TunnelSpec::from_configuration(&config.spec, tunnel_rules(ingress)),
    );
    tunnel.metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(namespace),
        labels: Some(ingress_labels(ingress, &name)),
        owner_references: Some(vec![owner]),
        ..Default::default()
    };
    Ok(tunnel)
}

fn ingress_labels(ingress: &Ingress, name: &str) -> BTreeMap<String, String> {
    managed_labels(ingress.metadata.labels.as_ref(), name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudflared_common::crd::{OriginCertReference, TunnelConfigurationSpec};
    use cloudflared_common::MANAGED_BY_LABEL;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressRuleValue, IngressClassSpec, IngressRule, IngressServiceBackend, IngressSpec,
        ServiceBackendPort,
    };

    fn service_backend(name: &str, port: i32) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: name.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(port),
                    name: None,
                }),
            }),
            resource: None,
        }
    }

    fn http_path(path: &str, path_type: &str, backend: IngressBackend) -> HTTPIngressPath {
        HTTPIngressPath {
            path: Some(path.to_string()),
            path_type: path_type.to_string(),
            backend,
        }
    }

    fn sample_ingress() -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-ing".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: Some("cloudflared".to_string()),
                default_backend: Some(service_backend("fallback", 8080)),
                rules: Some(vec![
                    IngressRule {
                        host: Some("web.example.com".to_string()),
                        http: Some(HTTPIngressRuleValue {
                            paths: vec![
                                http_path("/api", "Prefix", service_backend("api", 80)),
                                http_path("/", "Prefix", service_backend("web", 80)),
                            ],
                        }),
                    },
                    IngressRule {
                        host: Some("docs.example.com".to_string()),
                        http: Some(HTTPIngressRuleValue {
                            paths: vec![http_path("/v1.0", "Exact", service_backend("docs", 3000))],
                        }),
                    },
                ]),
                tls: None,
            }),
            status: None,
        }
    }

    fn sample_class(api_group: Option<&str>, kind: &str) -> IngressClass {
        IngressClass {
            metadata: ObjectMeta {
                name: Some("cloudflared".to_string()),
                ..Default::default()
            },
            spec: Some(IngressClassSpec {
                controller: Some(cloudflared_common::INGRESS_CONTROLLER_NAME.to_string()),
                parameters: Some(IngressClassParametersReference {
                    api_group: api_group.map(str::to_string),
                    kind: kind.to_string(),
                    name: "cf-config".to_string(),
                    namespace: None,
                    scope: None,
                }),
            }),
        }
    }

    #[test]
    fn test_rules_follow_ingress_order_with_default_backend_last() {
        let rules = tunnel_rules(&sample_ingress());
        assert_eq!(rules.len(), 4);

        assert_eq!(rules[0].hostname.as_deref(), Some("web.example.com"));
        assert_eq!(rules[0].path.as_deref(), Some("^/api"));
        assert_eq!(rules[0].service, "http://api:80");

        assert_eq!(rules[1].path, None);
        assert_eq!(rules[1].service, "http://web:80");

        assert_eq!(rules[2].hostname.as_deref(), Some("docs.example.com"));
        assert_eq!(rules[2].path.as_deref(), Some("^/v1\\.0$"));

        assert!(rules[3].is_catch_all());
        assert_eq!(rules[3].service, "http://fallback:8080");
    }

    #[test]
    fn test_default_backend_only() {
        let mut ingress = sample_ingress();
        ingress.spec.as_mut().unwrap().rules = None;
        let rules = tunnel_rules(&ingress);
        assert_eq!(rules, vec![TunnelIngressRule::catch_all("http://fallback:8080")]);
    }

    #[test]
    fn test_named_port_and_resource_backends() {
        let named = IngressBackend {
            service: Some(IngressServiceBackend {
                name: "web".to_string(),
                port: Some(ServiceBackendPort {
                    name: Some("http".to_string()),
                    number: None,
                }),
            }),
            resource: None,
        };
        assert_eq!(backend_service(&named).as_deref(), Some("http://web:http"));
        assert_eq!(backend_service(&IngressBackend::default()), None);
    }

    #[test]
    fn test_class_parameters_must_reference_tunnel_configuration() {
        let class = sample_class(Some(API_GROUP), PARAMETERS_KIND);
        assert_eq!(tunnel_configuration_ref(&class).unwrap().name, "cf-config");

        let wrong_group = sample_class(Some("example.com"), PARAMETERS_KIND);
        assert!(matches!(
            tunnel_configuration_ref(&wrong_group),
            Err(IngressError::InvalidParameters { .. })
        ));

        let wrong_kind = sample_class(Some(API_GROUP), "ConfigMap");
        assert!(tunnel_configuration_ref(&wrong_kind).is_err());

        let mut no_params = sample_class(Some(API_GROUP), PARAMETERS_KIND);
        no_params.spec.as_mut().unwrap().parameters = None;
        assert!(tunnel_configuration_ref(&no_params).is_err());
    }

    #[test]
    fn test_parameters_namespace_scope() {
        let mut params = sample_class(Some(API_GROUP), PARAMETERS_KIND)
            .spec
            .unwrap()
            .parameters
            .unwrap();
        assert_eq!(parameters_namespace(&params, "apps"), "apps");

        params.scope = Some("Namespace".to_string());
        params.namespace = Some("cloudflared".to_string());
        assert_eq!(parameters_namespace(&params, "apps"), "cloudflared");
    }

    #[test]
    fn test_is_controlled() {
        let class = sample_class(Some(API_GROUP), PARAMETERS_KIND);
        assert!(is_controlled(&class, cloudflared_common::INGRESS_CONTROLLER_NAME));
        assert!(!is_controlled(&class, "k8s.io/ingress-nginx"));
    }

    #[test]
    fn test_desired_tunnel_is_owned_by_ingress() {
        let config = TunnelConfiguration::new(
            "cf-config",
            TunnelConfigurationSpec {
                origin_cert: OriginCertReference::secret("cf-cert"),
                origin_request: None,
                image: Some("cloudflare/cloudflared:2024.1.0".to_string()),
            },
        );
        let tunnel = desired_tunnel(&sample_ingress(), &config).unwrap();

        assert_eq!(tunnel.name_any(), "web");
        assert_eq!(tunnel.namespace().as_deref(), Some("default"));
        let labels = tunnel.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app"], "web");
        assert_eq!(labels[MANAGED_BY_LABEL], "web");

        let owner = &tunnel.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Ingress");
        assert_eq!(owner.uid, "uid-ing");

        assert_eq!(tunnel.spec.origin_cert.name, "cf-cert");
        assert_eq!(
            tunnel.spec.image.as_deref(),
            Some("cloudflare/cloudflared:2024.1.0")
        );
        assert_eq!(tunnel.spec.rules.len(), 4);
    }
}
