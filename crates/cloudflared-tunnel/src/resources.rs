//! Child resource construction for a Tunnel
//!
//! Builds the credential Secret, the cloudflared ConfigMap and the
//! Deployment. Everything here is a pure function of the Tunnel; nothing
//! talks to the API server.

use std::collections::BTreeMap;

use cloudflared_api::TunnelCredentials;
use cloudflared_common::crd::{OriginRequest, Tunnel, TunnelIngressRule};
use cloudflared_common::kube_utils::managed_labels;
use cloudflared_common::MANAGED_BY_LABEL;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, KeyToPath, PodSpec, PodTemplateSpec,
    ProjectedVolumeSource, Secret, SecretProjection, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use serde::Serialize;

use crate::TunnelError;

/// Image used when neither the Tunnel nor the operator names one
pub const DEFAULT_CLOUDFLARED_IMAGE: &str = "cloudflare/cloudflared:2021.5.10";

/// Config map key holding the cloudflared configuration document
pub const CONFIG_KEY: &str = "config.yaml";

/// Service of the rule appended when the user's rules lack a catch-all
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

const CONTAINER_NAME: &str = "cloudflared";
const SECRET_VOLUME: &str = "secret";
const SECRET_MOUNT_PATH: &str = "/etc/cloudflared";
const CONFIG_VOLUME: &str = "config";
const CONFIG_MOUNT_PATH: &str = "/.cloudflared";
const ORIGIN_CERT_FILE: &str = "cert.pem";

/// Deterministic names of everything derived from one owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildNames {
    /// Name of the tunnel at Cloudflare
    pub external: String,
    /// Credential Secret
    pub secret: String,
    /// cloudflared ConfigMap
    pub config_map: String,
    /// cloudflared Deployment
    pub deployment: String,
}

impl ChildNames {
    pub fn for_owner(owner: &str) -> Self {
        Self {
            external: format!("t-{owner}"),
            secret: format!("{owner}-secret"),
            config_map: format!("{owner}-config"),
            deployment: owner.to_string(),
        }
    }

    /// Secret data key and file name of the credentials file
    pub fn credentials_file(&self) -> String {
        format!("{}.json", self.external)
    }
}

/// Derives the child resources of an owner object
pub trait OwnedResources {
    fn child_names(&self) -> &ChildNames;
    fn build_secret(&self, credentials: &TunnelCredentials) -> Result<Secret, TunnelError>;
    fn build_config_map(&self) -> Result<ConfigMap, TunnelError>;
    fn build_deployment(&self) -> Deployment;
}

#[derive(Serialize)]
struct CloudflaredConfig<'a> {
    tunnel: &'a str,
    #[serde(rename = "credentials-file")]
    credentials_file: String,
    #[serde(rename = "originRequest", skip_serializing_if = "Option::is_none")]
    origin_request: Option<&'a OriginRequest>,
    ingress: Vec<TunnelIngressRule>,
}

/// [`OwnedResources`] for a [`Tunnel`]
pub struct TunnelResources<'a> {
    tunnel: &'a Tunnel,
    name: String,
    namespace: String,
    names: ChildNames,
    owner_ref: OwnerReference,
    labels: BTreeMap<String, String>,
    image: String,
}

impl<'a> TunnelResources<'a> {
    /// Resources for `tunnel`, using `default_image` unless the spec overrides it
    pub fn new(tunnel: &'a Tunnel, default_image: &str) -> Result<Self, TunnelError> {
        let name = tunnel.name_any();
        let namespace = tunnel.namespace().ok_or(TunnelError::MissingNamespace)?;
        let owner_ref = tunnel.controller_owner_ref(&()).ok_or_else(|| {
            cloudflared_common::Error::missing_field("Tunnel", name.clone(), "metadata.uid")
        })?;
        Ok(Self {
            tunnel,
            names: ChildNames::for_owner(&name),
            labels: managed_labels(tunnel.metadata.labels.as_ref(), &name),
            image: tunnel
                .spec
                .image
                .clone()
                .unwrap_or_else(|| default_image.to_string()),
            name,
            namespace,
            owner_ref,
        })
    }

    fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels.clone()),
            owner_references: Some(vec![self.owner_ref.clone()]),
            ..Default::default()
        }
    }

    /// Rules in order, with a trailing catch-all when the user gave none
    fn ingress_rules(&self) -> Vec<TunnelIngressRule> {
        let mut rules = self.tunnel.spec.rules.clone();
        if !rules.last().is_some_and(TunnelIngressRule::is_catch_all) {
            rules.push(TunnelIngressRule::catch_all(CATCH_ALL_SERVICE));
        }
        rules
    }

    /// Render `config.yaml`
    pub fn config_document(&self) -> Result<String, TunnelError> {
        let config = CloudflaredConfig {
            tunnel: &self.names.external,
            credentials_file: format!("{}/{}", SECRET_MOUNT_PATH, self.names.credentials_file()),
            origin_request: self.tunnel.spec.origin_request.as_ref(),
            ingress: self.ingress_rules(),
        };
        Ok(serde_yaml::to_string(&config)?)
    }

    fn secret_volume(&self) -> Volume {
        let origin_cert = &self.tunnel.spec.origin_cert;
        Volume {
            name: SECRET_VOLUME.to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![
                    VolumeProjection {
                        secret: Some(SecretProjection {
                            name: self.names.secret.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    VolumeProjection {
                        secret: Some(SecretProjection {
                            name: origin_cert.name.clone(),
                            items: Some(vec![KeyToPath {
                                key: origin_cert.key().to_string(),
                                path: ORIGIN_CERT_FILE.to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl OwnedResources for TunnelResources<'_> {
    fn child_names(&self) -> &ChildNames {
        &self.names
    }

    /// Immutable Secret holding the credentials file
    fn build_secret(&self, credentials: &TunnelCredentials) -> Result<Secret, TunnelError> {
        let contents = serde_json::to_vec(credentials)?;
        Ok(Secret {
            metadata: self.metadata(&self.names.secret),
            immutable: Some(true),
            data: Some(BTreeMap::from([(
                self.names.credentials_file(),
                ByteString(contents),
            )])),
            ..Default::default()
        })
    }

    fn build_config_map(&self) -> Result<ConfigMap, TunnelError> {
        Ok(ConfigMap {
            metadata: self.metadata(&self.names.config_map),
            data: Some(BTreeMap::from([(
                CONFIG_KEY.to_string(),
                self.config_document()?,
            )])),
            ..Default::default()
        })
    }

    /// Deployment template with zero replicas
    ///
    /// The selector only uses the managed-by label because selectors are
    /// immutable while owner labels are not.
    fn build_deployment(&self) -> Deployment {
        let selector = BTreeMap::from([(MANAGED_BY_LABEL.to_string(), self.name.clone())]);

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            env: Some(vec![EnvVar {
                name: "TUNNEL_ORIGIN_CERT".to_string(),
                value: Some(format!("{SECRET_MOUNT_PATH}/{ORIGIN_CERT_FILE}")),
                ..Default::default()
            }]),
            command: Some(vec!["cloudflared".to_string(), "tunnel".to_string()]),
            args: Some(vec![
                "--no-autoupdate".to_string(),
                "--config".to_string(),
                format!("{CONFIG_MOUNT_PATH}/{CONFIG_KEY}"),
                "run".to_string(),
            ]),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: SECRET_VOLUME.to_string(),
                    mount_path: SECRET_MOUNT_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
                VolumeMount {
                    name: CONFIG_VOLUME.to_string(),
                    mount_path: CONFIG_MOUNT_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let config_volume = Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: self.names.config_map.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        Deployment {
            metadata: self.metadata(&self.names.deployment),
            spec: Some(DeploymentSpec {
                replicas: Some(0),
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(vec![self.secret_volume(), config_volume]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudflared_common::crd::{OriginCertReference, TunnelSpec};

    fn tunnel(rules: Vec<TunnelIngressRule>) -> Tunnel {
        let mut t = Tunnel::new(
            "web",
            TunnelSpec {
                origin_cert: OriginCertReference::secret("cf-cert"),
                origin_request: None,
                image: None,
                rules,
            },
        );
        t.metadata.namespace = Some("default".to_string());
        t.metadata.uid = Some("uid-1".to_string());
        t.metadata.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
        t
    }

    fn parse_config(cm: &ConfigMap) -> serde_yaml::Value {
        let data = cm.data.as_ref().unwrap();
        serde_yaml::from_str(&data[CONFIG_KEY]).unwrap()
    }

    #[test]
    fn test_child_names_are_deterministic() {
        let names = ChildNames::for_owner("web");
        assert_eq!(names.external, "t-web");
        assert_eq!(names.secret, "web-secret");
        assert_eq!(names.config_map, "web-config");
        assert_eq!(names.deployment, "web");
        assert_eq!(names.credentials_file(), "t-web.json");
    }

    #[test]
    fn test_requires_namespace_and_uid() {
        let mut t = tunnel(vec![]);
        t.metadata.namespace = None;
        assert!(matches!(
            TunnelResources::new(&t, DEFAULT_CLOUDFLARED_IMAGE),
            Err(TunnelError::MissingNamespace)
        ));

        let mut t = tunnel(vec![]);
        t.metadata.uid = None;
        assert!(matches!(
            TunnelResources::new(&t, DEFAULT_CLOUDFLARED_IMAGE),
            Err(TunnelError::Common(_))
        ));
    }

    #[test]
    fn test_config_document_lists_rules_in_order_plus_catch_all() {
        let t = tunnel(vec![
            TunnelIngressRule::new("b.example.com", "http://b:80"),
            TunnelIngressRule::new("a.example.com", "http://a:80"),
        ]);
        let res = TunnelResources::new(&t, DEFAULT_CLOUDFLARED_IMAGE).unwrap();
        let config = parse_config(&res.build_config_map().unwrap());

        assert_eq!(config["tunnel"], "t-web");
        assert_eq!(config["credentials-file"], "/etc/cloudflared/t-web.json");
        let ingress = config["ingress"].as_sequence().unwrap();
        assert_eq!(ingress.len(), 3);
        assert_eq!(ingress[0]["hostname"], "b.example.com");
        assert_eq!(ingress[1]["hostname"], "a.example.com");
        assert_eq!(ingress[2]["service"], CATCH_ALL_SERVICE);
        assert!(ingress[2].get("hostname").is_none());
    }

    #[test]
    fn test_existing_catch_all_is_not_duplicated() {
        let t = tunnel(vec![TunnelIngressRule::catch_all("http://default:80")]);
        let res = TunnelResources::new(&t, DEFAULT_CLOUDFLARED_IMAGE).unwrap();
        let config = parse_config(&res.build_config_map().unwrap());
        let ingress = config["ingress"].as_sequence().unwrap();
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0]["service"], "http://default:80");
    }

    #[test]
    fn test_origin_request_rendered_at_top_level() {
        let mut t = tunnel(vec![]);
        t.spec.origin_request = Some(OriginRequest {
            no_tls_verify: Some(true),
            ..Default::default()
        });
        let res = TunnelResources::new(&t, DEFAULT_CLOUDFLARED_IMAGE).unwrap();
        let config = parse_config(&res.build_config_map().unwrap());
        assert_eq!(config["originRequest"]["noTLSVerify"], true);
    }

    #[test]
    fn test_config_is_deterministic() {
        let t = tunnel(vec![TunnelIngressRule::new("a.example.com", "http://a:80")]);
        let res = TunnelResources::new(&t, DEFAULT_CLOUDFLARED_IMAGE).unwrap();
        assert_eq!(
            res.build_config_map().unwrap(),
            res.build_config_map().unwrap()
        );
    }

    #[test]
    fn test_secret_is_immutable_and_owned() {
        let t = tunnel(vec![]);
        let res = TunnelResources::new(&t, DEFAULT_CLOUDFLARED_IMAGE).unwrap();
        let creds = TunnelCredentials {
            account_tag: "acct".to_string(),
            tunnel_secret: "c2VjcmV0".to_string(),
            tunnel_id: "1111".to_string(),
            tunnel_name: "t-web".to_string(),
        };
        let secret = res.build_secret(&creds).unwrap();

        assert_eq!(secret.immutable, Some(true));
        assert_eq!(secret.metadata.name.as_deref(), Some("web-secret"));
        let owner = &secret.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Tunnel");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, Some(true));

        let stored = &secret.data.as_ref().unwrap()["t-web.json"];
        let parsed: TunnelCredentials = serde_json::from_slice(&stored.0).unwrap();
        assert_eq!(parsed, creds);
    }

    #[test]
    fn test_deployment_template() {
        let t = tunnel(vec![]);
        let res = TunnelResources::new(&t, DEFAULT_CLOUDFLARED_IMAGE).unwrap();
        let deployment = res.build_deployment();
        let spec = deployment.spec.as_ref().unwrap();

        assert_eq!(spec.replicas, Some(0));
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap()[MANAGED_BY_LABEL],
            "web"
        );

        let template_labels = spec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(template_labels["app"], "web");
        assert_eq!(template_labels[MANAGED_BY_LABEL], "web");

        let pod = spec.template.spec.as_ref().unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some(DEFAULT_CLOUDFLARED_IMAGE));
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec!["--no-autoupdate", "--config", "/.cloudflared/config.yaml", "run"]
        );

        let volumes = pod.volumes.as_ref().unwrap();
        let projected = volumes[0].projected.as_ref().unwrap().sources.as_ref().unwrap();
        assert_eq!(projected[0].secret.as_ref().unwrap().name, "web-secret");
        let cert = projected[1].secret.as_ref().unwrap();
        assert_eq!(cert.name, "cf-cert");
        assert_eq!(cert.items.as_ref().unwrap()[0].path, "cert.pem");
        assert_eq!(
            volumes[1].config_map.as_ref().unwrap().name,
            "web-config"
        );
    }

    #[test]
    fn test_image_override_from_spec() {
        let mut t = tunnel(vec![]);
        t.spec.image = Some("cloudflare/cloudflared:2024.1.0".to_string());
        let res = TunnelResources::new(&t, DEFAULT_CLOUDFLARED_IMAGE).unwrap();
        let deployment = res.build_deployment();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("cloudflare/cloudflared:2024.1.0")
        );
    }
}
