// Local port preflight

use tokio::net::TcpListener;

/// Check whether a local TCP port can still be bound. The check binds the
/// port and immediately releases it; a concurrent bind between the check and
/// the real listener is an accepted race.
pub async fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detects_occupied_and_released_port() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!is_port_free(port).await);

        drop(listener);
        assert!(is_port_free(port).await);
    }
}
