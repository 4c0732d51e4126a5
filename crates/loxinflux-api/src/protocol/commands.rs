// Command paths understood by the Miniserver.

use url::form_urlencoded::byte_serialize;

pub const GET_PUBLIC_KEY: &str = "jdev/sys/getPublicKey";
pub const GET_ONE_TIME_KEY: &str = "jdev/sys/getkey";
pub const ENABLE_STATUS_UPDATES: &str = "jdev/sps/enablebinstatusupdate";
pub const KEEPALIVE: &str = "keepalive";

/// Permission level requested with a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPermission {
    /// Short-lived web token.
    Web = 2,
    /// Long-lived app token.
    App = 4,
}

fn encode(component: &str) -> String {
    byte_serialize(component.as_bytes()).collect()
}

pub fn key_exchange(session_key_b64: &str) -> String {
    format!("jdev/sys/keyexchange/{session_key_b64}")
}

pub fn get_key2(user: &str) -> String {
    format!("jdev/sys/getkey2/{}", encode(user))
}

pub fn get_jwt(
    hash: &str,
    user: &str,
    permission: TokenPermission,
    client_uuid: &uuid::Uuid,
    client_info: &str,
) -> String {
    format!(
        "jdev/sys/getjwt/{hash}/{}/{}/{client_uuid}/{}",
        encode(user),
        permission as u8,
        encode(client_info)
    )
}

pub fn refresh_jwt(hash: &str, user: &str) -> String {
    format!("jdev/sys/refreshjwt/{hash}/{}", encode(user))
}

pub fn get_visu_salt(user: &str) -> String {
    format!("jdev/sys/getvisusalt/{}", encode(user))
}

pub fn io_all(uuid: &str) -> String {
    format!("jdev/sps/io/{uuid}/all")
}

pub fn secured_io_all(visu_hash: &str, uuid: &str) -> String {
    format!("jdev/sps/ios/{visu_hash}/{uuid}/all")
}

/// Wrap an already encrypted, base64-encoded command.
pub fn encrypted(cipher_b64: &str) -> String {
    format!("jdev/sys/enc/{}", encode(cipher_b64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_request_layout() {
        let client = uuid::Uuid::nil();
        assert_eq!(
            get_jwt("ab12", "admin", TokenPermission::App, &client, "loxinflux"),
            "jdev/sys/getjwt/ab12/admin/4/00000000-0000-0000-0000-000000000000/loxinflux"
        );
    }

    #[test]
    fn encrypted_payload_is_url_encoded() {
        assert_eq!(encrypted("a+b/c=="), "jdev/sys/enc/a%2Bb%2Fc%3D%3D");
    }

    #[test]
    fn user_names_are_escaped() {
        assert_eq!(get_key2("haus user"), "jdev/sys/getkey2/haus+user");
    }
}
