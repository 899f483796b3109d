use tracing::warn;

use taskmesh_core::errors::{MeshError, MeshResult};

/// 证书文本规范化
///
/// 去掉PEM的BEGIN/END标记行和所有空白字符，比较时不受换行与缩进
/// 格式差异影响。传输层已经完成身份验证，这里只做"是不是同一张
/// 证书"的判定。
pub fn canonical_cert(cert: &str) -> String {
    cert.lines()
        .filter(|line| {
            let trimmed = line.trim();
            !(trimmed.starts_with("-----BEGIN") || trimmed.starts_with("-----END"))
        })
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// 两张证书是否不同（规范化后比较）
pub fn certs_differ(a: &str, b: &str) -> bool {
    canonical_cert(a) != canonical_cert(b)
}

/// 本地限定动作的安全门
///
/// local_only处理器执行前调用：发送方证书与本节点证书不一致时返回
/// SecurityViolation，消息以被拒绝状态落库，不会静默丢弃。
pub fn authorize_local(expected_cert: &str, presented_cert: &str) -> MeshResult<()> {
    if certs_differ(expected_cert, presented_cert) {
        warn!("本地限定动作的发送方证书与本节点证书不匹配，拒绝执行");
        return Err(MeshError::SecurityViolation);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT_A: &str = "-----BEGIN CERTIFICATE-----\nMIIBxzCCAVGg\nQWERTY0123\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_canonicalization_ignores_format() {
        // 相同内容、不同缩进和换行
        let reflowed = "  -----BEGIN CERTIFICATE-----\n  MIIBxzCC AVGg\nQWERTY0123  \n-----END CERTIFICATE-----";
        assert!(!certs_differ(CERT_A, reflowed));
        assert_eq!(canonical_cert(CERT_A), "MIIBxzCCAVGgQWERTY0123");
    }

    #[test]
    fn test_different_certs_differ() {
        let other = "-----BEGIN CERTIFICATE-----\nZZZZZZZZ\n-----END CERTIFICATE-----\n";
        assert!(certs_differ(CERT_A, other));
    }

    #[test]
    fn test_authorize_local() {
        assert!(authorize_local(CERT_A, CERT_A).is_ok());
        let err = authorize_local(CERT_A, "其他证书").unwrap_err();
        assert!(matches!(err, MeshError::SecurityViolation));
    }
}
