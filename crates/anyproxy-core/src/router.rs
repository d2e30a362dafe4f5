//! Model-name routing: look the logical model up in the route store, pick
//! one enabled route, and build the upstream URL for its protocol.

use rand::Rng;
use tracing::warn;

use anyproxy_storage::RouteStorage;
use anyproxy_transform::Proto;

use crate::error::ProxyError;

#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub route_id: i64,
    pub display_name: String,
    pub url: String,
    pub credential: Option<String>,
    pub proto: Proto,
    pub model: String,
}

pub async fn resolve_route(
    storage: &RouteStorage,
    model: &str,
    stream: bool,
) -> Result<RouteTarget, ProxyError> {
    let (route, proto) = pick_route(storage, model).await?;
    Ok(RouteTarget {
        route_id: route.id,
        display_name: route.display_name,
        url: build_upstream_url(&route.upstream_url, proto, model, stream),
        credential: route.credential.filter(|credential| !credential.is_empty()),
        proto,
        model: model.to_string(),
    })
}

/// Resolution for the raw passthrough endpoints: same route pick, caller
/// supplies the upstream path verbatim.
pub async fn resolve_route_with_suffix(
    storage: &RouteStorage,
    model: &str,
    suffix: &str,
) -> Result<RouteTarget, ProxyError> {
    let (route, proto) = pick_route(storage, model).await?;
    let base = route.upstream_url.strip_suffix('/').unwrap_or(&route.upstream_url);
    let url = format!("{base}{suffix}");
    Ok(RouteTarget {
        route_id: route.id,
        display_name: route.display_name.clone(),
        url,
        credential: route.credential.filter(|credential| !credential.is_empty()),
        proto,
        model: model.to_string(),
    })
}

async fn pick_route(
    storage: &RouteStorage,
    model: &str,
) -> Result<(anyproxy_storage::entities::routes::Model, Proto), ProxyError> {
    let routes = storage
        .routes_for_model(model)
        .await
        .map_err(|err| ProxyError::Storage(err.to_string()))?;

    if routes.is_empty() {
        let available = storage
            .available_models()
            .await
            .map_err(|err| ProxyError::Storage(err.to_string()))?;
        return Err(ProxyError::ModelNotFound {
            model: model.to_string(),
            available,
        });
    }

    // Multiple enabled routes for one model load-balance uniformly.
    let mut routes = routes;
    let pick = if routes.len() == 1 {
        0
    } else {
        rand::rng().random_range(0..routes.len())
    };
    let route = routes.swap_remove(pick);

    let proto = Proto::from_format_tag(&route.format_tag).unwrap_or_else(|| {
        warn!(
            event = "unknown_format_tag",
            route_id = route.id,
            format_tag = %route.format_tag
        );
        Proto::OpenAI
    });

    Ok((route, proto))
}

/// Trailing slash is trimmed exactly once, then the per-protocol suffix is
/// appended. Gemini streaming gets `alt=sse` so the upstream speaks
/// `data:`-line SSE like the other two.
pub fn build_upstream_url(base: &str, proto: Proto, model: &str, stream: bool) -> String {
    let base = base.strip_suffix('/').unwrap_or(base);
    match proto {
        Proto::OpenAI => format!("{base}/v1/chat/completions"),
        Proto::Claude => format!("{base}/v1/messages"),
        Proto::Gemini => {
            if stream {
                format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
            } else {
                format!("{base}/v1beta/models/{model}:generateContent")
            }
        }
    }
}
