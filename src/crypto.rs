use sha1::{Digest, Sha1};

/// 校验微信服务器的请求是否合规。
/// 将token、timestamp、nonce按字典序排序后拼接，取sha1的十六进制摘要与签名比对。
pub fn check_signature(signature: &str, timestamp: &str, nonce: &str, token: &str) -> bool {
    let mut raw = [token, timestamp, nonce];
    raw.sort_unstable();
    let digest = Sha1::digest(raw.concat().as_bytes());
    let hex_digest = base16ct::lower::encode_string(&digest);
    signature == hex_digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_signature() {
        // sorted: ["1000", "abc", "xyz"] -> sha1("1000abcxyz")
        assert!(check_signature(
            "31ab2cbf25ffd5a584363d2b1e9d25ea66b0b214",
            "1000",
            "xyz",
            "abc"
        ));
    }

    #[test]
    fn test_check_signature_mismatch() {
        assert!(!check_signature(
            "31ab2cbf25ffd5a584363d2b1e9d25ea66b0b214",
            "1001",
            "xyz",
            "abc"
        ));
    }
}
