//! Advertising-data (AD structure) helpers.

/// "Incomplete list of 16-bit service UUIDs".
const AD_TYPE_UUID16_INCOMPLETE: u8 = 0x02;
/// "Complete list of 16-bit service UUIDs".
const AD_TYPE_UUID16_COMPLETE: u8 = 0x03;

/// Check if raw advertisement data lists `uuid` among its 16-bit service UUIDs.
///
/// Structures that declare more bytes than remain are clamped to the
/// buffer, and an odd trailing byte in a UUID list is ignored.
pub fn contains_service_uuid16(data: &[u8], uuid: u16) -> bool {
    let wanted = uuid.to_le_bytes();

    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 || i + 1 >= data.len() {
            break;
        }
        let ad_type = data[i + 1];
        if ad_type == AD_TYPE_UUID16_INCOMPLETE || ad_type == AD_TYPE_UUID16_COMPLETE {
            let end = (i + 1 + len).min(data.len());
            let uuid_data = &data[i + 2..end];
            if uuid_data.chunks_exact(2).any(|chunk| chunk == wanted) {
                return true;
            }
        }
        i += len + 1;
    }
    false
}
