//! Rendering of peer records into WireGuard and BIRD configuration text
//!
//! Templates are Jinja (minijinja) sources. They are compiled once at
//! startup, and a reference to any name outside [`TEMPLATE_VARIABLES`] is
//! rejected then rather than at the first add.

use minijinja::{context, AutoEscape, Environment, UndefinedBehavior, Value};
use thiserror::Error;

use crate::model::{interface_name, Asn, PeerRecord};

/// Built-in wg-quick template
pub const DEFAULT_WIREGUARD_TEMPLATE: &str = "\
[Interface]
PrivateKey = {{ local_private_key }}
ListenPort = {{ listen_port }}
PostUp = ip -6 addr add {{ local_link_local }}/64 dev %i
Table = off

[Peer]
PublicKey = {{ peer_public_key }}
Endpoint = {{ peer_endpoint }}
AllowedIPs = 0.0.0.0/0, ::/0
";

/// Built-in BIRD multiprotocol BGP peer template
pub const DEFAULT_BIRD_TEMPLATE: &str = "\
protocol bgp {{ interface_name }} from dnpeers {
    neighbor {{ peer_link_local }} % '{{ interface_name }}' as {{ peer_asn }};
}
";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template '{template}': {source}")]
    Syntax {
        template: &'static str,
        source: minijinja::Error,
    },

    #[error("template '{template}': unknown placeholder '{name}'")]
    UnknownPlaceholder { template: &'static str, name: String },

    #[error("template '{template}' failed to render: {source}")]
    Render {
        template: &'static str,
        source: minijinja::Error,
    },
}

const WIREGUARD: &str = "wireguard";
const BIRD: &str = "bird";

/// Names a template may reference
pub const TEMPLATE_VARIABLES: &[&str] = &[
    "interface_name",
    "local_private_key",
    "local_link_local",
    "listen_port",
    "peer_asn",
    "peer_endpoint",
    "peer_link_local",
    "peer_public_key",
];

/// Tunnel and routing-daemon templates, compiled once at startup
#[derive(Debug, Clone)]
pub struct Templates {
    env: Environment<'static>,
}

impl Templates {
    pub fn parse(wireguard: &str, bird: &str) -> Result<Self, TemplateError> {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);

        add_template(&mut env, WIREGUARD, wireguard)?;
        add_template(&mut env, BIRD, bird)?;
        Ok(Self { env })
    }

    pub fn builtin() -> Self {
        // The built-in sources only use known placeholders
        Self::parse(DEFAULT_WIREGUARD_TEMPLATE, DEFAULT_BIRD_TEMPLATE)
            .unwrap_or_else(|e| unreachable!("built-in template is invalid: {}", e))
    }

    fn render(&self, name: &'static str, ctx: &Value) -> Result<String, TemplateError> {
        let render_err = |source| TemplateError::Render {
            template: name,
            source,
        };
        self.env
            .get_template(name)
            .and_then(|template| template.render(ctx))
            .map_err(render_err)
    }
}

fn add_template(
    env: &mut Environment<'static>,
    name: &'static str,
    source: &str,
) -> Result<(), TemplateError> {
    let syntax_err = |source| TemplateError::Syntax {
        template: name,
        source,
    };
    env.add_template_owned(name, source.to_string())
        .map_err(syntax_err)?;
    let template = env.get_template(name).map_err(syntax_err)?;

    let mut unknown: Vec<String> = template
        .undeclared_variables(false)
        .into_iter()
        .filter(|var| !TEMPLATE_VARIABLES.contains(&var.as_str()))
        .collect();
    unknown.sort();
    match unknown.into_iter().next() {
        Some(var) => Err(TemplateError::UnknownPlaceholder {
            template: name,
            name: var,
        }),
        None => Ok(()),
    }
}

/// First digit of every tunnel listen port (`prefix * 10000 + asn % 10000`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPrefix(u16);

impl PortPrefix {
    pub const MIN: u16 = 1;
    pub const MAX: u16 = 5;

    pub fn new(prefix: u16) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&prefix).then_some(Self(prefix))
    }

    /// Always within 10000..=59999
    pub fn listen_port(&self, asn: Asn) -> u16 {
        self.0 * 10_000 + (asn % 10_000) as u16
    }
}

/// Settings of this router that appear in every rendered file
#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub private_key: String,
    pub link_local: String,
    pub port_prefix: PortPrefix,
}

/// Output of rendering one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub interface_name: String,
    pub tunnel_config: String,
    pub routing_config: String,
}

/// Pure mapping from a peer record to its configuration artifacts
#[derive(Debug, Clone)]
pub struct Renderer {
    local: LocalSettings,
    templates: Templates,
}

impl Renderer {
    pub fn new(local: LocalSettings, templates: Templates) -> Self {
        Self { local, templates }
    }

    pub fn listen_port(&self, asn: Asn) -> u16 {
        self.local.port_prefix.listen_port(asn)
    }

    pub fn render(&self, peer: &PeerRecord) -> Result<RenderedConfig, TemplateError> {
        let interface_name = interface_name(peer.asn);
        let ctx = context! {
            interface_name => &interface_name,
            local_private_key => &self.local.private_key,
            local_link_local => &self.local.link_local,
            listen_port => self.listen_port(peer.asn),
            peer_asn => peer.asn,
            peer_endpoint => &peer.wireguard_endpoint,
            peer_link_local => &peer.wireguard_link_local,
            peer_public_key => &peer.wireguard_public_key,
        };
        Ok(RenderedConfig {
            tunnel_config: self.templates.render(WIREGUARD, &ctx)?,
            routing_config: self.templates.render(BIRD, &ctx)?,
            interface_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> Renderer {
        Renderer::new(
            LocalSettings {
                private_key: "cHJpdmF0ZS1rZXktZm9yLXRlc3Rpbmctb25seS0xMjM=".to_string(),
                link_local: "fe80::1".to_string(),
                port_prefix: PortPrefix::new(2).unwrap(),
            },
            Templates::builtin(),
        )
    }

    fn peer() -> PeerRecord {
        PeerRecord {
            asn: 4_242_421_234,
            wireguard_endpoint: "peer.example.net:51820".to_string(),
            wireguard_link_local: "fe80::beef".to_string(),
            wireguard_public_key: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string(),
        }
    }

    #[test]
    fn test_render_wireguard() {
        let rendered = renderer().render(&peer()).unwrap();
        assert_eq!(rendered.interface_name, "dn4242421234");
        assert!(rendered.tunnel_config.contains("ListenPort = 21234\n"));
        assert!(rendered.tunnel_config.contains("Endpoint = peer.example.net:51820\n"));
        assert!(rendered
            .tunnel_config
            .contains("PublicKey = AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=\n"));
        assert!(rendered.tunnel_config.contains("addr add fe80::1/64"));
        assert!(!rendered.tunnel_config.contains("{{"));
    }

    #[test]
    fn test_render_bird() {
        let rendered = renderer().render(&peer()).unwrap();
        assert_eq!(
            rendered.routing_config,
            "protocol bgp dn4242421234 from dnpeers {\n    \
             neighbor fe80::beef % 'dn4242421234' as 4242421234;\n}\n"
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let r = renderer();
        assert_eq!(r.render(&peer()).unwrap(), r.render(&peer()).unwrap());
    }

    #[test]
    fn test_custom_template() {
        let templates = Templates::parse("port={{listen_port}}", "as{{ peer_asn }}").unwrap();
        let r = Renderer::new(renderer().local, templates);
        let rendered = r.render(&peer()).unwrap();
        assert_eq!(rendered.tunnel_config, "port=21234");
        assert_eq!(rendered.routing_config, "as4242421234");
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err = Templates::parse(DEFAULT_WIREGUARD_TEMPLATE, "{{ peer_name }}").unwrap_err();
        assert!(matches!(
            err,
            TemplateError::UnknownPlaceholder { template: "bird", ref name } if name == "peer_name"
        ));

        // Names bound inside the template are not placeholders
        let loop_var = "{% for p in [1, 2] %}{{ p }}{% endfor %}{{ peer_asn }}";
        assert!(Templates::parse(loop_var, DEFAULT_BIRD_TEMPLATE).is_ok());

        assert!(matches!(
            Templates::parse("oops {{ peer_asn", DEFAULT_BIRD_TEMPLATE),
            Err(TemplateError::Syntax { template: "wireguard", .. })
        ));
    }

    #[test]
    fn test_template_expressions() {
        let templates = Templates::parse(
            "{% if listen_port > 20000 %}high{% endif %} {{ peer_endpoint | upper }}",
            "{{ peer_link_local }}\n",
        )
        .unwrap();
        let rendered = Renderer::new(renderer().local, templates)
            .render(&peer())
            .unwrap();
        assert_eq!(rendered.tunnel_config, "high PEER.EXAMPLE.NET:51820");
        assert_eq!(rendered.routing_config, "fe80::beef\n");
    }

    #[test]
    fn test_render_error_names_template() {
        let templates =
            Templates::parse("{{ peer_endpoint.host }}", DEFAULT_BIRD_TEMPLATE).unwrap();
        let err = Renderer::new(renderer().local, templates)
            .render(&peer())
            .unwrap_err();
        assert!(matches!(err, TemplateError::Render { template: "wireguard", .. }));
    }

    #[test]
    fn test_port_prefix() {
        assert!(PortPrefix::new(0).is_none());
        assert!(PortPrefix::new(6).is_none());
        let p = PortPrefix::new(5).unwrap();
        assert_eq!(p.listen_port(4_242_429_999), 59_999);
        assert_eq!(PortPrefix::new(1).unwrap().listen_port(4_242_420_000), 10_000);
    }
}
