//! Concurrent decryption of embedded ciphertext fragments.
//!
//! Fragments are discovered with a single regex pass, fanned out to a small
//! worker pool, and substituted back by their full match text. The pass fails
//! fast: the first fragment that cannot be decrypted cancels the remaining
//! work and aborts the resolve call.

use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{decrypt_fragment, CipherSettings, CryptoError, ENCRYPTED_PREFIX};

#[derive(Debug, Error)]
pub enum DecryptPassError {
    #[error("decryption of {fragment} failed: {source}")]
    Fragment {
        fragment: String,
        #[source]
        source: CryptoError,
    },

    #[error("the decryption workers exited before finishing")]
    WorkersExited,
}

/// One discovered fragment awaiting decryption.
struct DecryptRequest {
    full_match: String,
    ciphertext_b64: String,
}

/// Outcome for one fragment, keyed by its full match text.
struct DecryptResult {
    full_match: String,
    outcome: Result<String, CryptoError>,
}

/// Replaces every `$ocm_encrypted:<base64>` fragment in `text` with its
/// plaintext.
///
/// `concurrency` caps the worker pool; 0 and 1 both mean sequential. The
/// worker count never exceeds the number of fragments, and the output is
/// byte-identical regardless of concurrency because substitution happens by
/// match text, one occurrence per result.
pub async fn decrypt_embedded(
    settings: &CipherSettings,
    concurrency: u8,
    text: &str,
) -> Result<String, DecryptPassError> {
    // The base64 class must include `=` so trailing padding stays inside the
    // match; the first non-base64 character terminates it.
    let pattern = Regex::new(&format!(
        "{}([A-Za-z0-9+/=]+)",
        regex::escape(ENCRYPTED_PREFIX)
    ))
    .expect("the fragment pattern compiles");

    let requests: Vec<DecryptRequest> = pattern
        .captures_iter(text)
        .map(|captures| DecryptRequest {
            full_match: captures[0].to_string(),
            ciphertext_b64: captures[1].to_string(),
        })
        .collect();

    if requests.is_empty() {
        return Ok(text.to_string());
    }

    let total = requests.len();
    let workers = total.min(usize::from(concurrency).max(1));
    tracing::debug!(fragments = total, workers, "decrypting embedded fragments");

    // Both channels hold every outstanding item, so neither side ever blocks
    // on capacity; closing is by drop.
    let (request_tx, request_rx) = mpsc::channel::<DecryptRequest>(total);
    let (result_tx, mut result_rx) = mpsc::channel::<DecryptResult>(total);
    let request_rx = Arc::new(Mutex::new(request_rx));
    let cancel = CancellationToken::new();

    for _ in 0..workers {
        let requests = Arc::clone(&request_rx);
        let results = result_tx.clone();
        let cancel = cancel.clone();
        let settings = settings.clone();

        tokio::spawn(async move {
            decrypt_worker(settings, requests, results, cancel).await;
        });
    }
    drop(result_tx);

    for request in requests {
        if request_tx.send(request).await.is_err() {
            break;
        }
    }
    drop(request_tx);

    let mut resolved = text.to_string();
    for _ in 0..total {
        let Some(result) = result_rx.recv().await else {
            cancel.cancel();
            return Err(DecryptPassError::WorkersExited);
        };

        match result.outcome {
            Ok(plaintext) => {
                // One occurrence per result: duplicate fragments produce
                // duplicate matches and each replaces its own occurrence.
                resolved = resolved.replacen(&result.full_match, &plaintext, 1);
            }
            Err(source) => {
                cancel.cancel();
                tracing::debug!(fragment = %result.full_match, error = %source, "decryption failed");

                return Err(DecryptPassError::Fragment {
                    fragment: result.full_match,
                    source,
                });
            }
        }
    }

    tracing::debug!(fragments = total, "finished decrypting fragments");

    Ok(resolved)
}

async fn decrypt_worker(
    settings: CipherSettings,
    requests: Arc<Mutex<mpsc::Receiver<DecryptRequest>>>,
    results: mpsc::Sender<DecryptResult>,
    cancel: CancellationToken,
) {
    loop {
        let request = {
            let mut requests = requests.lock().await;

            tokio::select! {
                _ = cancel.cancelled() => return,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => return,
                },
            }
        };

        let outcome = decrypt_fragment(&settings, &request.ciphertext_b64);
        let result = DecryptResult {
            full_match: request.full_match,
            outcome,
        };

        // Re-check cancellation before publishing so a cancelled pass never
        // leaves a worker blocked on an abandoned result channel.
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = results.send(result) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::protect;

    fn settings() -> CipherSettings {
        CipherSettings::new(vec![7u8; 32], None, b"abcdefghijklmnop".to_vec())
            .expect("valid test settings")
    }

    fn protected(settings: &CipherSettings, value: &str) -> String {
        protect(settings, value).expect("encrypt")
    }

    #[test]
    fn test_text_without_fragments_is_untouched() {
        tokio_test::block_on(async {
            let settings = settings();
            let text = "kind: ConfigMap\ndata:\n  key: value\n";
            let resolved = decrypt_embedded(&settings, 4, text).await.expect("pass");
            assert_eq!(resolved, text);
        });
    }

    #[test]
    fn test_fragments_are_replaced_in_place() {
        tokio_test::block_on(async {
            let settings = settings();
            let text = format!(
                "user: {}\npassword: {}\n",
                protected(&settings, "admin"),
                protected(&settings, "hunter2"),
            );

            let resolved = decrypt_embedded(&settings, 2, &text).await.expect("pass");
            assert_eq!(resolved, "user: admin\npassword: hunter2\n");
        });
    }

    #[test]
    fn test_duplicate_fragments_replace_independently() {
        tokio_test::block_on(async {
            let settings = settings();
            let fragment = protected(&settings, "same");
            let text = format!("a: {fragment}\nb: {fragment}\n");

            let resolved = decrypt_embedded(&settings, 3, &text).await.expect("pass");
            assert_eq!(resolved, "a: same\nb: same\n");
        });
    }

    #[test]
    fn test_output_is_identical_across_worker_counts() {
        tokio_test::block_on(async {
            let settings = settings();
            let mut text = String::new();
            for i in 0..12 {
                text.push_str(&format!(
                    "key{i}: {}\n",
                    protected(&settings, &format!("value-{i}"))
                ));
            }

            let sequential = decrypt_embedded(&settings, 1, &text).await.expect("pass");
            for concurrency in [0u8, 2, 4, 12, 255] {
                let parallel = decrypt_embedded(&settings, concurrency, &text)
                    .await
                    .expect("pass");
                assert_eq!(parallel, sequential, "concurrency {concurrency} diverged");
            }
        });
    }

    #[test]
    fn test_first_failure_cancels_the_pass() {
        tokio_test::block_on(async {
            let settings = settings();
            // Well-formed base64 of five bytes: decodable, but not a whole
            // number of AES blocks, so decryption always fails for it.
            let bogus = format!("{ENCRYPTED_PREFIX}aGVsbG8=");
            let mut text = format!("broken: {bogus}\n");
            for i in 0..8 {
                text.push_str(&format!(
                    "key{i}: {}\n",
                    protected(&settings, &format!("value-{i}"))
                ));
            }

            let err = decrypt_embedded(&settings, 4, &text)
                .await
                .expect_err("the bogus fragment must fail the pass");
            match err {
                DecryptPassError::Fragment { fragment, .. } => {
                    assert_eq!(fragment, bogus, "the error names the failed fragment");
                }
                other => panic!("expected a fragment error, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_fragment_pattern_stops_at_non_base64_characters() {
        tokio_test::block_on(async {
            let settings = settings();
            let fragment = protected(&settings, "inner");
            // The fragment is embedded mid-line and followed by YAML syntax;
            // the match must stop at the first non-base64 character.
            let text = format!("arg: --token={fragment},next\n");

            let resolved = decrypt_embedded(&settings, 1, &text).await.expect("pass");
            assert_eq!(resolved, "arg: --token=inner,next\n");
        });
    }
}
