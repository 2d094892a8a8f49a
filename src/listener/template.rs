//! Server configuration rendered into the chart's config map
//!
//! The same template produces the raft config for both deployment passes and
//! the known-good configuration written during repair, so the two can never
//! drift apart.

use minijinja::{context, Environment};

use crate::config::{BootstrapConfig, API_PORT, CLUSTER_PORT};

const TEMPLATE_NAME: &str = "server.hcl";

const SERVER_CONFIG: &str = r#"ui = true

listener "tcp" {
  address = "[::]:{{ api_port }}"
  cluster_address = "[::]:{{ cluster_port }}"
{% if tls %}
  tls_disable = false
  tls_cert_file = "{{ tls_dir }}/tls.crt"
  tls_key_file = "{{ tls_dir }}/tls.key"
  tls_client_ca_file = "{{ tls_dir }}/ca.crt"
{% else %}
  tls_disable = true
{% endif %}
}

storage "raft" {
  path = "/vault/data"
}

service_registration "kubernetes" {}
"#;

/// Render the server configuration with the listener's TLS on or off
pub fn render_server_config(
    config: &BootstrapConfig,
    tls: bool,
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.add_template(TEMPLATE_NAME, SERVER_CONFIG)?;

    env.get_template(TEMPLATE_NAME)?.render(context! {
        api_port => API_PORT,
        cluster_port => CLUSTER_PORT,
        tls => tls,
        tls_dir => config.tls_mount_dir(),
    })
}
