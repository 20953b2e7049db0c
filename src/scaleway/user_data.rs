//! Cloud-init user data for Scaleway servers.
//!
//! Scaleway exposes instance user data as a per-server key/value store. When
//! the key is `cloud-init`, the value is consumed by cloud-init on the
//! server's first boot.

/// Reserved user-data key that Scaleway recognises for cloud-init payloads.
pub(crate) const CLOUD_INIT_USER_DATA_KEY: &str = "cloud-init";

pub(crate) fn user_data_url(zone: &str, server_id: &str, key: &str) -> String {
    format!("https://api.scaleway.com/instance/v1/zones/{zone}/servers/{server_id}/user_data/{key}")
}

/// Renders a cloud-config document that authorises `public_key` for
/// `login_user`, creating the account when it is not `root`.
pub(crate) fn render_cloud_config(login_user: &str, public_key: &str) -> String {
    // JSON strings are valid YAML scalars, which keeps arbitrary input quoted.
    let key = serde_json::Value::from(public_key.trim()).to_string();
    let user = serde_json::Value::from(login_user.trim()).to_string();
    if login_user.trim() == "root" {
        format!(
            "#cloud-config\ndisable_root: false\nusers:\n  - name: root\n    ssh_authorized_keys:\n      - {key}\n"
        )
    } else {
        format!(
            concat!(
                "#cloud-config\n",
                "users:\n",
                "  - default\n",
                "  - name: {user}\n",
                "    shell: /bin/bash\n",
                "    sudo: \"ALL=(ALL) NOPASSWD:ALL\"\n",
                "    ssh_authorized_keys:\n",
                "      - {key}\n",
            ),
            user = user,
            key = key,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_user_data_url() {
        let url = user_data_url("fr-par-1", "server-123", CLOUD_INIT_USER_DATA_KEY);
        assert_eq!(
            url,
            "https://api.scaleway.com/instance/v1/zones/fr-par-1/servers/server-123/user_data/cloud-init"
        );
    }

    #[test]
    fn root_login_authorises_root() {
        let rendered = render_cloud_config("root", "ssh-ed25519 AAAA hatch-abc\n");
        assert!(rendered.starts_with("#cloud-config\n"));
        assert!(rendered.contains("disable_root: false"));
        assert!(rendered.contains("- name: root"));
        assert!(rendered.contains("- \"ssh-ed25519 AAAA hatch-abc\""));
    }

    #[test]
    fn other_users_are_created_with_sudo() {
        let rendered = render_cloud_config("dev", "ssh-ed25519 AAAA hatch-abc");
        assert!(rendered.contains("  - default\n"));
        assert!(rendered.contains("- name: \"dev\""));
        assert!(rendered.contains("NOPASSWD:ALL"));
        assert!(rendered.contains("- \"ssh-ed25519 AAAA hatch-abc\""));
    }
}
