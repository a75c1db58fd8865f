use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::errors::{SyncError, SyncResult};
use crate::core::helpers::new_id;
use crate::remote::{ImageSource, ObjectStore, UploadRequest};

/// Cancels the remote upload if the uploading future is dropped mid-flight.
struct UploadGuard {
    objects: Arc<dyn ObjectStore>,
    request_id: String,
    armed: bool,
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let objects = Arc::clone(&self.objects);
        let request_id = std::mem::take(&mut self.request_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    objects.cancel(&request_id).await;
                });
            }
            Err(_) => warn!(request_id = %request_id, "no runtime left to cancel upload"),
        }
    }
}

/// Uploads an image and returns its secure URL. Nothing is written to the
/// document store here; callers only continue once the URL is known.
pub async fn upload_image(
    objects: Arc<dyn ObjectStore>,
    image: ImageSource,
    preset: &str,
) -> SyncResult<String> {
    if image.is_empty() {
        return Err(SyncError::Upload("Image payload is empty.".to_string()));
    }

    let request_id = new_id();
    let mut guard = UploadGuard {
        objects: Arc::clone(&objects),
        request_id: request_id.clone(),
        armed: true,
    };

    let request = UploadRequest {
        request_id: request_id.clone(),
        image,
        preset: preset.to_string(),
    };
    let result = objects.upload(request).await;
    guard.armed = false;

    match result {
        Ok(url) if url.is_empty() => Err(SyncError::Upload("Image URL was empty.".to_string())),
        Ok(url) => {
            debug!(request_id = %request_id, url = %url, "image uploaded");
            Ok(url)
        }
        Err(e) => Err(SyncError::Upload(e.to_string())),
    }
}
