//! Relayed request handlers: gallery, templates, datasets, DB browsing,
//! health. Each pairs with one bus subject through `service::serve`.

use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use store::TemplateFormat;
use tracing::warn;
use wire::{
    subjects, DatasetImagesRequest, DatasetImagesResponse, DatasetListResponse,
    DatasetSubjectsRequest, DatasetSubjectsResponse, DbRowRequest, DbRowResponse, DbRowsRequest,
    DbRowsResponse, DbSchemaResponse, DbStatsResponse, DecryptTemplateRequest,
    DecryptTemplateResponse, DeleteIdentityRequest, DeleteIdentityResponse, EngineHealthResponse,
    ErrorBody, ErrorKind, GalleryResponse, RegisterPathsRequest, RegisterPathsResponse,
    TemplateGetRequest, TemplateGetResponse,
};

use crate::service::EngineService;

// ============================================================================
// Gallery
// ============================================================================

pub async fn gallery_list(svc: Arc<EngineService>, _req: serde_json::Value) -> GalleryResponse {
    match store::db::list_gallery(&svc.db).await {
        Ok(identities) => GalleryResponse { identities },
        Err(e) => {
            warn!("gallery listing failed: {e}");
            GalleryResponse {
                identities: Vec::new(),
            }
        }
    }
}

pub async fn gallery_delete(
    svc: Arc<EngineService>,
    req: DeleteIdentityRequest,
) -> DeleteIdentityResponse {
    match store::db::delete_identity(&svc.db, req.identity_id).await {
        Ok((deleted, templates_removed)) => {
            if deleted {
                let version = svc.gallery.remove_identity(req.identity_id);
                tracing::info!(
                    "identity {} deleted ({} templates, gallery v{version})",
                    req.identity_id,
                    templates_removed
                );
            }
            DeleteIdentityResponse {
                deleted,
                templates_removed,
            }
        }
        Err(e) => {
            warn!("identity deletion failed: {e}");
            DeleteIdentityResponse {
                deleted: false,
                templates_removed: 0,
            }
        }
    }
}

pub async fn template_get(
    svc: Arc<EngineService>,
    req: TemplateGetRequest,
) -> TemplateGetResponse {
    let not_found = TemplateGetResponse {
        template: None,
        identity_id: None,
        iris_codes_b64: Vec::new(),
        mask_codes_b64: Vec::new(),
        error: Some(ErrorBody::new(
            ErrorKind::InvalidInput,
            format!("template {} not found", req.template_id),
        )),
    };

    let template = match store::db::get_template(&svc.db, req.template_id).await {
        Ok(t) => t,
        Err(store::StoreError::NotFound) => return not_found,
        Err(e) => {
            return TemplateGetResponse {
                template: None,
                identity_id: None,
                iris_codes_b64: Vec::new(),
                mask_codes_b64: Vec::new(),
                error: Some(ErrorBody::new(ErrorKind::Persistence, e.to_string())),
            }
        }
    };

    // Masks are plaintext in both formats.
    let mask_codes_b64 = match store::template::decode_plain_blob(&template.mask_codes) {
        Ok(scales) => scales.iter().map(|s| B64.encode(&s.data)).collect(),
        Err(e) => {
            warn!("mask blob of {} is undecodable: {e}", template.template_id);
            Vec::new()
        }
    };

    let iris_codes_b64 = match template.format {
        TemplateFormat::Plain => match store::template::decode_plain_blob(&template.iris_codes) {
            Ok(scales) => scales.iter().map(|s| B64.encode(&s.data)).collect(),
            Err(e) => {
                return TemplateGetResponse {
                    template: Some(template.meta()),
                    identity_id: Some(template.identity_id),
                    iris_codes_b64: Vec::new(),
                    mask_codes_b64,
                    error: Some(ErrorBody::new(ErrorKind::Persistence, e.to_string())),
                }
            }
        },
        TemplateFormat::EncryptedV1 => {
            // Decryption is the key service's call to make.
            let request = DecryptTemplateRequest {
                template_id: template.template_id,
                iris_blob_b64: B64.encode(&template.iris_codes),
            };
            match svc
                .bus
                .request_json::<_, DecryptTemplateResponse>(
                    subjects::KEY_DECRYPT_TEMPLATE,
                    &request,
                    svc.cfg.key_request_timeout,
                )
                .await
            {
                Ok(decrypted) if decrypted.error.is_none() => decrypted.iris_codes_b64,
                Ok(decrypted) => {
                    return TemplateGetResponse {
                        template: Some(template.meta()),
                        identity_id: Some(template.identity_id),
                        iris_codes_b64: Vec::new(),
                        mask_codes_b64,
                        error: Some(ErrorBody::new(
                            ErrorKind::KeyService,
                            decrypted.error.unwrap_or_default(),
                        )),
                    }
                }
                Err(e) => {
                    return TemplateGetResponse {
                        template: Some(template.meta()),
                        identity_id: Some(template.identity_id),
                        iris_codes_b64: Vec::new(),
                        mask_codes_b64,
                        error: Some(ErrorBody::new(ErrorKind::KeyService, e.to_string())),
                    }
                }
            }
        }
    };

    TemplateGetResponse {
        template: Some(template.meta()),
        identity_id: Some(template.identity_id),
        iris_codes_b64,
        mask_codes_b64,
        error: None,
    }
}

// ============================================================================
// Datasets
// ============================================================================

pub async fn datasets_list(
    svc: Arc<EngineService>,
    _req: serde_json::Value,
) -> DatasetListResponse {
    DatasetListResponse {
        datasets: svc.registry.list(),
    }
}

pub async fn datasets_subjects(
    svc: Arc<EngineService>,
    req: DatasetSubjectsRequest,
) -> DatasetSubjectsResponse {
    match svc.registry.subjects(&req.dataset) {
        Ok(subjects) => DatasetSubjectsResponse {
            subjects,
            error: None,
        },
        Err(e) => DatasetSubjectsResponse {
            subjects: Vec::new(),
            error: Some(ErrorBody::new(
                ErrorKind::InvalidInput,
                format!("unknown dataset {:?}", e.0),
            )),
        },
    }
}

pub async fn datasets_images(
    svc: Arc<EngineService>,
    req: DatasetImagesRequest,
) -> DatasetImagesResponse {
    match svc.registry.images(&req.dataset, req.subject.as_deref()) {
        Ok(images) => DatasetImagesResponse {
            images,
            error: None,
        },
        Err(e) => DatasetImagesResponse {
            images: Vec::new(),
            error: Some(ErrorBody::new(
                ErrorKind::InvalidInput,
                format!("unknown dataset {:?}", e.0),
            )),
        },
    }
}

pub async fn datasets_register(
    svc: Arc<EngineService>,
    req: RegisterPathsRequest,
) -> RegisterPathsResponse {
    let paths: Vec<PathBuf> = req.paths.iter().map(PathBuf::from).collect();
    let registered = svc.registry.register(&paths);
    RegisterPathsResponse {
        registered,
        datasets: svc.registry.list(),
    }
}

// ============================================================================
// DB browsing
// ============================================================================

pub async fn db_schema(svc: Arc<EngineService>, _req: serde_json::Value) -> DbSchemaResponse {
    match store::db::schema(&svc.db).await {
        Ok(schema) => schema,
        Err(e) => {
            warn!("schema query failed: {e}");
            DbSchemaResponse { tables: Vec::new() }
        }
    }
}

pub async fn db_rows(svc: Arc<EngineService>, req: DbRowsRequest) -> DbRowsResponse {
    match store::db::table_rows(&svc.db, &req.table, req.limit, req.offset).await {
        Ok(rows) => DbRowsResponse { rows, error: None },
        Err(e) => DbRowsResponse {
            rows: Vec::new(),
            error: Some(ErrorBody::new(ErrorKind::InvalidInput, e.to_string())),
        },
    }
}

pub async fn db_row(svc: Arc<EngineService>, req: DbRowRequest) -> DbRowResponse {
    match store::db::row_by_pk(&svc.db, &req.table, &req.pk).await {
        Ok(row) => DbRowResponse { row, error: None },
        Err(e) => DbRowResponse {
            row: None,
            error: Some(ErrorBody::new(ErrorKind::InvalidInput, e.to_string())),
        },
    }
}

pub async fn db_stats(svc: Arc<EngineService>, _req: serde_json::Value) -> DbStatsResponse {
    match store::db::stats(&svc.db).await {
        Ok(tables) => DbStatsResponse { tables },
        Err(e) => {
            warn!("stats query failed: {e}");
            DbStatsResponse { tables: Vec::new() }
        }
    }
}

// ============================================================================
// Health
// ============================================================================

pub async fn engine_health(
    svc: Arc<EngineService>,
    _req: serde_json::Value,
) -> EngineHealthResponse {
    svc.health().await
}
