use crate::domain::{AssetHandle, AssetRef, ContactRecord, ImageRef};

/// Pick the image that accompanies a contact's message, first match wins:
/// contact image, pre-uploaded default, raw default, nothing.
pub fn resolve(
    contact: &ContactRecord,
    default_image: Option<&ImageRef>,
    uploaded_default: Option<&AssetHandle>,
) -> Option<AssetRef> {
    if let Some(img) = contact.image.as_ref().filter(|i| i.is_usable()) {
        return Some(AssetRef::Local(img.clone()));
    }
    if let Some(handle) = uploaded_default {
        return Some(AssetRef::Uploaded(handle.clone()));
    }
    default_image
        .filter(|i| i.is_usable())
        .map(|i| AssetRef::Local(i.clone()))
}
