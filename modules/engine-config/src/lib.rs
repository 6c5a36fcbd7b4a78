//! Renders a descriptor plus a local port binding into the JSON config the
//! external engine binary consumes. Pure: no I/O, equal inputs give
//! structurally equal output.

use serde_json::{json, Value};
use tunnelrank_core::{EndpointDescriptor, LocalBinding, Security, Transport};

/// Knobs that apply uniformly to every generated config.
#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    /// UDP association on the socks inbound.
    pub enable_udp: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self { enable_udp: false }
    }
}

// Connection-multiplexing ceilings are fixed for every outbound; probes
// compare candidates, so per-descriptor tuning would skew the ranking.
const MUX_CONCURRENCY: u32 = 50;
const MUX_XUDP_CONCURRENCY: u32 = 128;

/// Build the engine config for one probe attempt.
///
/// Inbounds: an `http` listener on the control port and a `socks` listener
/// (noauth) on the data port, both on loopback. Outbound: the descriptor's
/// endpoint with its credential, stream settings and the fixed mux block.
pub fn build(descriptor: &EndpointDescriptor, binding: &LocalBinding, opts: BuildOptions) -> Value {
    json!({
        "inbounds": [
            {
                "port": binding.http.port(),
                "listen": "127.0.0.1",
                "protocol": "http",
                "settings": {}
            },
            {
                "port": binding.socks.port(),
                "listen": "127.0.0.1",
                "protocol": "socks",
                "settings": {
                    "auth": "noauth",
                    "udp": opts.enable_udp,
                    "ip": "127.0.0.1"
                }
            }
        ],
        "outbounds": [
            {
                "protocol": "vless",
                "settings": {
                    "vnext": [
                        {
                            "address": descriptor.host,
                            "port": descriptor.port,
                            "users": [
                                {
                                    "id": descriptor.user_id,
                                    "encryption": descriptor.encryption,
                                    "flow": descriptor.flow
                                }
                            ]
                        }
                    ]
                },
                "streamSettings": stream_settings(descriptor),
                "mux": {
                    "enabled": true,
                    "concurrency": MUX_CONCURRENCY,
                    "xudpConcurrency": MUX_XUDP_CONCURRENCY,
                    "xudpProxyUDP443": "allow"
                }
            }
        ]
    })
}

fn stream_settings(descriptor: &EndpointDescriptor) -> Value {
    let tls_settings = if descriptor.security == Security::Tls {
        json!({
            "serverName": descriptor.sni,
            "alpn": descriptor.alpn.clone().unwrap_or_default()
        })
    } else {
        json!({})
    };

    let ws_settings = if descriptor.transport == Transport::Ws {
        let headers = match &descriptor.host_header {
            Some(host) => json!({ "Host": host }),
            None => json!({}),
        };
        json!({
            "path": descriptor.path.clone().unwrap_or_default(),
            "headers": headers
        })
    } else {
        json!({})
    };

    json!({
        "network": descriptor.transport.as_str(),
        "security": descriptor.security.as_str(),
        "tlsSettings": tls_settings,
        "wsSettings": ws_settings
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelrank_core::PortAllocator;

    fn descriptor() -> EndpointDescriptor {
        EndpointDescriptor {
            user_id: "abc-123".into(),
            host: "1.2.3.4".into(),
            port: 443,
            transport: Transport::Tcp,
            security: Security::Tls,
            flow: Some("xtls-rprx-vision".into()),
            encryption: "none".into(),
            sni: Some("example.com".into()),
            alpn: Some(vec!["h2".into(), "http/1.1".into()]),
            host_header: None,
            path: None,
            label: "NodeA".into(),
        }
    }

    #[test]
    fn build_is_pure() {
        let alloc = PortAllocator::new();
        let binding = alloc.binding().unwrap();
        let d = descriptor();
        assert_eq!(
            build(&d, &binding, BuildOptions::default()),
            build(&d, &binding, BuildOptions::default())
        );
    }

    #[test]
    fn inbounds_use_both_claimed_ports() {
        let alloc = PortAllocator::new();
        let binding = alloc.binding().unwrap();
        let cfg = build(&descriptor(), &binding, BuildOptions::default());
        assert_eq!(
            cfg["inbounds"][0]["port"],
            json!(binding.http.port())
        );
        assert_eq!(cfg["inbounds"][0]["protocol"], json!("http"));
        assert_eq!(
            cfg["inbounds"][1]["port"],
            json!(binding.socks.port())
        );
        assert_eq!(cfg["inbounds"][1]["protocol"], json!("socks"));
        assert_eq!(cfg["inbounds"][1]["settings"]["auth"], json!("noauth"));
        assert_eq!(cfg["inbounds"][1]["settings"]["udp"], json!(false));
    }

    #[test]
    fn udp_flag_reaches_socks_settings() {
        let alloc = PortAllocator::new();
        let binding = alloc.binding().unwrap();
        let cfg = build(&descriptor(), &binding, BuildOptions { enable_udp: true });
        assert_eq!(cfg["inbounds"][1]["settings"]["udp"], json!(true));
    }

    #[test]
    fn outbound_carries_endpoint_and_credential() {
        let alloc = PortAllocator::new();
        let binding = alloc.binding().unwrap();
        let cfg = build(&descriptor(), &binding, BuildOptions::default());
        let vnext = &cfg["outbounds"][0]["settings"]["vnext"][0];
        assert_eq!(vnext["address"], json!("1.2.3.4"));
        assert_eq!(vnext["port"], json!(443));
        assert_eq!(vnext["users"][0]["id"], json!("abc-123"));
        assert_eq!(vnext["users"][0]["flow"], json!("xtls-rprx-vision"));
    }

    #[test]
    fn tls_embeds_server_name_and_alpn() {
        let alloc = PortAllocator::new();
        let binding = alloc.binding().unwrap();
        let cfg = build(&descriptor(), &binding, BuildOptions::default());
        let stream = &cfg["outbounds"][0]["streamSettings"];
        assert_eq!(stream["security"], json!("tls"));
        assert_eq!(stream["tlsSettings"]["serverName"], json!("example.com"));
        assert_eq!(stream["tlsSettings"]["alpn"], json!(["h2", "http/1.1"]));
    }

    #[test]
    fn non_tls_leaves_tls_settings_empty() {
        let alloc = PortAllocator::new();
        let binding = alloc.binding().unwrap();
        let mut d = descriptor();
        d.security = Security::None;
        let cfg = build(&d, &binding, BuildOptions::default());
        let stream = &cfg["outbounds"][0]["streamSettings"];
        assert_eq!(stream["tlsSettings"], json!({}));
    }

    #[test]
    fn websocket_embeds_path_and_host_header() {
        let alloc = PortAllocator::new();
        let binding = alloc.binding().unwrap();
        let mut d = descriptor();
        d.transport = Transport::Ws;
        d.path = Some("/tunnel".into());
        d.host_header = Some("cdn.example.com".into());
        let cfg = build(&d, &binding, BuildOptions::default());
        let stream = &cfg["outbounds"][0]["streamSettings"];
        assert_eq!(stream["network"], json!("ws"));
        assert_eq!(stream["wsSettings"]["path"], json!("/tunnel"));
        assert_eq!(
            stream["wsSettings"]["headers"]["Host"],
            json!("cdn.example.com")
        );
    }

    #[test]
    fn mux_block_is_fixed() {
        let alloc = PortAllocator::new();
        let binding = alloc.binding().unwrap();
        let cfg = build(&descriptor(), &binding, BuildOptions::default());
        let mux = &cfg["outbounds"][0]["mux"];
        assert_eq!(mux["enabled"], json!(true));
        assert_eq!(mux["concurrency"], json!(50));
        assert_eq!(mux["xudpConcurrency"], json!(128));
        assert_eq!(mux["xudpProxyUDP443"], json!("allow"));
    }
}
