//! OpenAPI documentation
//!
//! Serves the OpenAPI 3.0 document and a Swagger UI page for the trigger surface.

use axum::{
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde_json::json;

/// Create OpenAPI routes
pub fn create_openapi_routes() -> Router {
    Router::new()
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
}

async fn openapi_json() -> impl IntoResponse {
    Json(get_openapi_spec())
}

async fn swagger_ui() -> impl IntoResponse {
    Html(SWAGGER_UI_HTML)
}

fn dispatch_run_operation(method: &str) -> serde_json::Value {
    json!({
        "tags": ["dispatch"],
        "summary": "Run one dispatch pass",
        "description": "Activates due scheduled campaigns, sends due retries and the next batch of every active campaign, then returns a per-campaign summary.",
        "operationId": format!("runDispatch{}", method),
        "security": [{"bearerAuth": []}, {"apiKey": []}],
        "responses": {
            "200": {
                "description": "Dispatch pass summary",
                "content": {
                    "application/json": {
                        "schema": {"$ref": "#/components/schemas/DispatchSummary"}
                    }
                }
            },
            "401": {"description": "Missing or invalid trigger token"},
            "500": {
                "description": "Candidate campaigns could not be loaded",
                "content": {
                    "application/json": {
                        "schema": {"$ref": "#/components/schemas/ErrorResponse"}
                    }
                }
            }
        }
    })
}

/// Get the OpenAPI specification as JSON
fn get_openapi_spec() -> serde_json::Value {
    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "Outreach API",
            "description": "Trigger surface for the Outreach campaign dispatch engine.\n\n## Authentication\n\nWhen a trigger token is configured, dispatch routes require it.\n\n- **Header**: `X-API-Key: <token>`\n- **Bearer**: `Authorization: Bearer <token>`",
            "version": "1.0.0",
            "license": {
                "name": "Apache-2.0",
                "url": "https://www.apache.org/licenses/LICENSE-2.0"
            }
        },
        "tags": [
            {"name": "health", "description": "Health check endpoints"},
            {"name": "dispatch", "description": "Campaign dispatch trigger"},
            {"name": "metrics", "description": "Prometheus metrics"}
        ],
        "paths": {
            "/health": {
                "get": {
                    "tags": ["health"],
                    "summary": "Basic health check",
                    "operationId": "health",
                    "responses": {
                        "200": {
                            "description": "Service is healthy",
                            "content": {
                                "application/json": {
                                    "schema": {"$ref": "#/components/schemas/HealthResponse"}
                                }
                            }
                        }
                    }
                }
            },
            "/health/live": {
                "get": {
                    "tags": ["health"],
                    "summary": "Liveness probe",
                    "operationId": "liveness",
                    "responses": {
                        "200": {"description": "Service is alive"}
                    }
                }
            },
            "/health/ready": {
                "get": {
                    "tags": ["health"],
                    "summary": "Readiness probe",
                    "operationId": "readiness",
                    "responses": {
                        "200": {"description": "Service is ready"},
                        "503": {"description": "Database is unreachable"}
                    }
                }
            },
            "/api/v1/dispatch/run": {
                "post": dispatch_run_operation("Post"),
                "get": dispatch_run_operation("Get")
            },
            "/metrics": {
                "get": {
                    "tags": ["metrics"],
                    "summary": "Prometheus text exposition",
                    "operationId": "metrics",
                    "responses": {
                        "200": {
                            "description": "Metrics in Prometheus text format",
                            "content": {"text/plain": {"schema": {"type": "string"}}}
                        }
                    }
                }
            }
        },
        "components": {
            "securitySchemes": {
                "bearerAuth": {"type": "http", "scheme": "bearer"},
                "apiKey": {"type": "apiKey", "in": "header", "name": "X-API-Key"}
            },
            "schemas": {
                "HealthResponse": {
                    "type": "object",
                    "required": ["status"],
                    "properties": {
                        "status": {"type": "string", "example": "healthy"}
                    }
                },
                "ErrorResponse": {
                    "type": "object",
                    "required": ["error", "message"],
                    "properties": {
                        "error": {"type": "string", "example": "DATABASE_ERROR"},
                        "message": {"type": "string"}
                    }
                },
                "DispatchSummary": {
                    "type": "object",
                    "required": ["started_at", "finished_at", "found", "processed", "campaigns"],
                    "properties": {
                        "started_at": {"type": "string", "format": "date-time"},
                        "finished_at": {"type": "string", "format": "date-time"},
                        "found": {"type": "integer", "description": "Campaigns that needed attention"},
                        "processed": {"type": "integer", "description": "Campaigns that sent or retried a batch"},
                        "campaigns": {
                            "type": "array",
                            "items": {"$ref": "#/components/schemas/CampaignOutcome"}
                        }
                    }
                },
                "CampaignOutcome": {
                    "type": "object",
                    "required": ["id", "name", "processed", "sent", "failed"],
                    "properties": {
                        "id": {"type": "string", "format": "uuid"},
                        "name": {"type": "string"},
                        "processed": {"type": "boolean"},
                        "sent": {"type": "integer", "description": "Successful sends in this run"},
                        "failed": {"type": "integer", "description": "Failed sends in this run"},
                        "note": {"type": "string", "example": "scheduled, sends in 2h 5m"},
                        "error": {"type": "string", "example": "insufficient balance"}
                    }
                }
            }
        }
    })
}

const SWAGGER_UI_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Outreach API Documentation</title>
    <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5.9.0/swagger-ui.css" />
    <style>
        body { margin: 0; padding: 0; }
        .swagger-ui .topbar { display: none; }
    </style>
</head>
<body>
    <div id="swagger-ui"></div>
    <script src="https://unpkg.com/swagger-ui-dist@5.9.0/swagger-ui-bundle.js"></script>
    <script>
        window.onload = function() {
            SwaggerUIBundle({
                url: "/openapi.json",
                dom_id: '#swagger-ui',
                deepLinking: true,
                presets: [
                    SwaggerUIBundle.presets.apis,
                    SwaggerUIBundle.SwaggerUIStandalonePreset
                ],
                layout: "StandaloneLayout"
            });
        };
    </script>
</body>
</html>"#;
