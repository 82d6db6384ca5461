//! Request handler for serving a local transport to peers.

use std::collections::HashSet;

use resin_core::{Id, Transport, TransportError};

use crate::protocol::{Request, Response, StoredRecord};

fn error_response(e: TransportError) -> Response {
    Response::Error {
        transient: e.is_transient(),
        message: e.to_string(),
    }
}

/// Handle an incoming request against a local transport.
///
/// `Get` answers carry at most `max_response_bytes` of record content, but
/// always at least one record when any was found. `Put` is acknowledged
/// only after the transport has been flushed.
pub async fn handle_request(
    store: &dyn Transport,
    request: Request,
    max_response_bytes: usize,
) -> Response {
    tracing::debug!(kind = request.kind(), store = store.name(), "serving request");
    match request {
        Request::Get { ids } => match store.load_many(&ids).await {
            Ok(loaded) => {
                let present: HashSet<Id> = loaded.iter().map(|(id, _)| *id).collect();
                let missing = ids
                    .into_iter()
                    .filter(|id| !present.contains(id))
                    .collect();
                Response::Records {
                    found: within_budget(loaded, max_response_bytes),
                    missing,
                }
            }
            Err(e) => error_response(e),
        },

        Request::Has { ids } => match store.exists(&ids).await {
            Ok(present) => Response::Has {
                present: ids.iter().map(|id| present.contains(id)).collect(),
            },
            Err(e) => error_response(e),
        },

        Request::Put { records } => {
            let ids = records.iter().map(|record| record.id).collect();
            let records = records.into_iter().map(Into::into).collect();
            let stored = match store.save_many(records).await {
                Ok(()) => store.flush().await,
                Err(e) => Err(e),
            };
            match stored {
                Ok(()) => Response::Stored { ids },
                Err(e) => error_response(e),
            }
        }
    }
}

fn within_budget(loaded: Vec<(Id, Vec<u8>)>, max_bytes: usize) -> Vec<StoredRecord> {
    let total = loaded.len();
    let mut bytes = 0usize;
    let mut found = Vec::new();
    for (id, content) in loaded {
        if !found.is_empty() && bytes + content.len() > max_bytes {
            break;
        }
        bytes += content.len();
        found.push(StoredRecord { id, content });
    }
    if found.len() < total {
        tracing::debug!(
            sent = found.len(),
            deferred = total - found.len(),
            "response size limit reached"
        );
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use resin_core::MemoryTransport;

    const NO_LIMIT: usize = usize::MAX;

    fn id(n: u8) -> Id {
        Id::from_bytes([n; 32])
    }

    #[tokio::test]
    async fn handle_get_found_and_missing() {
        let store = MemoryTransport::new();
        store.save(id(1), b"data".to_vec()).await.unwrap();

        let response = handle_request(
            &store,
            Request::Get {
                ids: vec![id(1), id(2)],
            },
            NO_LIMIT,
        )
        .await;

        if let Response::Records { found, missing } = response {
            assert_eq!(found, vec![StoredRecord::from((id(1), b"data".to_vec()))]);
            assert_eq!(missing, vec![id(2)]);
        } else {
            panic!("Expected Records response");
        }
    }

    #[tokio::test]
    async fn get_response_is_bounded_by_size() {
        let store = MemoryTransport::new();
        for n in 1..=4 {
            store.save(id(n), vec![n; 40]).await.unwrap();
        }

        let response = handle_request(
            &store,
            Request::Get {
                ids: vec![id(1), id(2), id(3), id(4), id(5)],
            },
            100,
        )
        .await;

        if let Response::Records { found, missing } = response {
            assert_eq!(found.len(), 2);
            assert_eq!(missing, vec![id(5)]);
        } else {
            panic!("Expected Records response");
        }
    }

    #[tokio::test]
    async fn oversized_record_is_still_served() {
        let store = MemoryTransport::new();
        store.save(id(1), vec![0; 500]).await.unwrap();

        let response = handle_request(&store, Request::Get { ids: vec![id(1)] }, 100).await;

        assert!(matches!(response, Response::Records { found, .. } if found.len() == 1));
    }

    #[tokio::test]
    async fn handle_has() {
        let store = MemoryTransport::new();
        store.save(id(1), b"data".to_vec()).await.unwrap();

        let response = handle_request(
            &store,
            Request::Has {
                ids: vec![id(1), id(2)],
            },
            NO_LIMIT,
        )
        .await;

        if let Response::Has { present } = response {
            assert_eq!(present, vec![true, false]);
        } else {
            panic!("Expected Has response");
        }
    }

    #[tokio::test]
    async fn handle_put() {
        let store = MemoryTransport::new();

        let response = handle_request(
            &store,
            Request::Put {
                records: vec![(id(3), b"value".to_vec()).into()],
            },
            NO_LIMIT,
        )
        .await;

        if let Response::Stored { ids } = response {
            assert_eq!(ids, vec![id(3)]);
        } else {
            panic!("Expected Stored response");
        }

        assert_eq!(store.get(&id(3)), Some(b"value".to_vec()));
    }
}
