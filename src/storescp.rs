//! Embedded C-STORE SCP that receives the instances a C-MOVE redirects to us.
//!
//! Association handling mostly follows dicom-rs' storescp.
//! https://github.com/Enet4/dicom-rs/blob/dbd41ed3a0d1536747c6b8ea2b286e4c6e8ccc8a/storescp/src/main.rs

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::Pdu;
use dicom::ul::pdu::PDataValueType;
use ulid::Ulid;

use crate::association_error::{AssociationError, AssociationError::*};
use crate::types::OurAETitle;

/// State shared between the downloader and the store handler.
///
/// `current_series_dir` is advanced by the downloader before each C-MOVE.
/// One C-MOVE is in flight at a time, so the handler only ever reads the
/// directory of the series currently being transferred.
pub(crate) struct DownloadState {
    pub(crate) current_series_dir: Mutex<Utf8PathBuf>,
    pub(crate) files_received: AtomicU64,
}

impl DownloadState {
    pub(crate) fn new(initial_dir: Utf8PathBuf) -> Self {
        Self {
            current_series_dir: Mutex::new(initial_dir),
            files_received: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_series_dir(&self, dir: Utf8PathBuf) {
        *self.current_series_dir.lock().unwrap() = dir;
    }

    pub(crate) fn received(&self) -> u64 {
        self.files_received.load(Ordering::Relaxed)
    }
}

#[derive(thiserror::Error, Debug)]
enum StorageError {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Write(#[from] dicom::object::WriteError),
}

/// Accept associations until `shutdown` is set, handling each on its own
/// thread. The listener must already be bound; binding errors belong to the
/// caller so a busy port fails the study up front.
pub(crate) fn run_store_scp(
    listener: TcpListener,
    aet: OurAETitle,
    read_timeout: Duration,
    state: Arc<DownloadState>,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    listener.set_nonblocking(true)?;
    tracing::info!(aet = aet.as_str(), "C-STORE SCP listening");
    let mut handles = Vec::new();
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                let aet = aet.clone();
                let state = Arc::clone(&state);
                handles.push(thread::spawn(move || {
                    let ulid = Ulid::new();
                    if let Err(e) = handle_store_association(stream, &aet, read_timeout, &state)
                    {
                        tracing::error!(
                            association_ulid = ulid.to_string(),
                            peer = peer.to_string(),
                            "{:?}",
                            e
                        );
                    }
                }));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                tracing::error!("failed to accept incoming association: {e}");
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

/// Serve one association: answer C-ECHO, write each received instance to the
/// current series directory, and respond with DICOM status 0x0000 on success
/// or 0xA700 when the instance could not be stored.
fn handle_store_association(
    scu_stream: TcpStream,
    aet: &OurAETitle,
    read_timeout: Duration,
    state: &DownloadState,
) -> Result<(), AssociationError> {
    let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
    let mut msgid = 1;
    let mut sop_class_uid = "".to_string();
    let mut sop_instance_uid = "".to_string();

    let mut options = dicom::ul::association::ServerAssociationOptions::new()
        .accept_any()
        .ae_title(aet.as_str())
        .timeout(read_timeout)
        .strict(false);

    for ts in TransferSyntaxRegistry.iter() {
        if !ts.is_unsupported() {
            options = options.with_transfer_syntax(ts.uid());
        }
    }

    let mut association = options.establish(scu_stream).map_err(CouldNotEstablish)?;
    tracing::debug!(
        aec = association.client_ae_title(),
        "association established"
    );

    while let Some(mut pdu) = bubble_no_pdu(association.receive())? {
        match pdu {
            Pdu::PData { ref mut data } => {
                if data.is_empty() {
                    continue;
                }

                if data[0].value_type == PDataValueType::Data && !data[0].is_last {
                    instance_buffer.append(&mut data[0].data);
                } else if data[0].value_type == PDataValueType::Command && data[0].is_last {
                    // commands are always in implict VR LE
                    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
                    let data_value = &data[0];
                    let v = &data_value.data;

                    let obj = InMemDicomObject::read_dataset_with_ts(v.as_slice(), &ts)
                        .map_err(FailedToReadCommand)?;
                    let command_field = obj
                        .element(tags::COMMAND_FIELD)
                        .map_err(|_| MissingTag(tags::COMMAND_FIELD))?
                        .uint16()
                        .map_err(|_| InvalidNumber(tags::COMMAND_FIELD))?;

                    if command_field == 0x0030 {
                        // C-ECHO-RQ; some PACS validate the destination first
                        let cecho_response = create_cecho_response(msgid);
                        let mut cecho_data = Vec::new();

                        cecho_response
                            .write_dataset_with_ts(&mut cecho_data, &ts)
                            .map_err(|_| CannotRespond("Could not write C-ECHO response object"))?;

                        let pdu_response = Pdu::PData {
                            data: vec![dicom::ul::pdu::PDataValue {
                                presentation_context_id: data[0].presentation_context_id,
                                value_type: PDataValueType::Command,
                                is_last: true,
                                data: cecho_data,
                            }],
                        };
                        association.send(&pdu_response).map_err(|_| {
                            CannotRespond("failed to send C-ECHO response object to SCU")
                        })?;
                    } else {
                        msgid = obj
                            .element(tags::MESSAGE_ID)
                            .map_err(|_| MissingTag(tags::MESSAGE_ID))?
                            .to_int()
                            .map_err(|_| InvalidNumber(tags::MESSAGE_ID))?;
                        sop_class_uid = obj
                            .element(tags::AFFECTED_SOP_CLASS_UID)
                            .map_err(|_| MissingTag(tags::AFFECTED_SOP_CLASS_UID))?
                            .to_str()
                            .map_err(|_| CouldNotRetrieve(tags::AFFECTED_SOP_CLASS_UID))?
                            .to_string();
                        sop_instance_uid = obj
                            .element(tags::AFFECTED_SOP_INSTANCE_UID)
                            .map_err(|_| MissingTag(tags::AFFECTED_SOP_INSTANCE_UID))?
                            .to_str()
                            .map_err(|_| CouldNotRetrieve(tags::AFFECTED_SOP_INSTANCE_UID))?
                            .to_string();
                    }
                    instance_buffer.clear();
                } else if data[0].value_type == PDataValueType::Data && data[0].is_last {
                    instance_buffer.append(&mut data[0].data);

                    let presentation_context = association
                        .presentation_contexts()
                        .iter()
                        .find(|pc| pc.id == data[0].presentation_context_id)
                        .ok_or(MissingPresentationContext)?;
                    let ts = &presentation_context.transfer_syntax;

                    let obj = InMemDicomObject::read_dataset_with_ts(
                        instance_buffer.as_slice(),
                        TransferSyntaxRegistry
                            .get(ts)
                            .ok_or(MissingPresentationContext)?,
                    )
                    .map_err(FailedToReadObject)?;
                    let file_meta = FileMetaTableBuilder::new()
                        .media_storage_sop_class_uid(
                            obj.element(tags::SOP_CLASS_UID)
                                .map_err(|_| MissingTag(tags::SOP_CLASS_UID))?
                                .to_str()
                                .map_err(|_| CouldNotRetrieve(tags::SOP_CLASS_UID))?,
                        )
                        .media_storage_sop_instance_uid(
                            obj.element(tags::SOP_INSTANCE_UID)
                                .map_err(|_| MissingTag(tags::SOP_INSTANCE_UID))?
                                .to_str()
                                .map_err(|_| CouldNotRetrieve(tags::SOP_INSTANCE_UID))?,
                        )
                        .transfer_syntax(ts)
                        .build()
                        .map_err(FailedToBuildMeta)?;

                    let file_obj = obj.with_exact_meta(file_meta);
                    let status = match store_instance(state, file_obj, &sop_instance_uid) {
                        Ok(path) => {
                            tracing::debug!(event = "storage", path = path.into_string());
                            0x0000
                        }
                        Err(e) => {
                            tracing::error!(event = "storage", error = e.to_string());
                            0xA700
                        }
                    };

                    // send C-STORE-RSP object
                    // commands are always in implict VR LE
                    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();

                    let obj =
                        create_cstore_response(msgid, &sop_class_uid, &sop_instance_uid, status);

                    let mut obj_data = Vec::new();

                    obj.write_dataset_with_ts(&mut obj_data, &ts)
                        .map_err(|_| CannotRespond("could not write response object"))?;

                    let pdu_response = Pdu::PData {
                        data: vec![dicom::ul::pdu::PDataValue {
                            presentation_context_id: data[0].presentation_context_id,
                            value_type: PDataValueType::Command,
                            is_last: true,
                            data: obj_data,
                        }],
                    };
                    association
                        .send(&pdu_response)
                        .map_err(|_| CannotRespond("failed to send response object to SCU"))?;
                }
            }
            Pdu::ReleaseRQ => {
                association.send(&Pdu::ReleaseRP).unwrap_or_else(|e| {
                    tracing::warn!("failed to send association release: {e}");
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Write one received instance to `{current_series_dir}/{SOPInstanceUID}.dcm`.
fn store_instance(
    state: &DownloadState,
    obj: DefaultDicomObject,
    sop_instance_uid: &str,
) -> Result<Utf8PathBuf, StorageError> {
    let dir = state.current_series_dir.lock().unwrap().clone();
    fs_err::create_dir_all(&dir)?;
    let fname = format!("{}.dcm", sop_instance_uid.trim_matches(['\0', ' ']));
    let output_path = dir.join(fname);
    obj.write_to_file(&output_path)?;
    let received = state.files_received.fetch_add(1, Ordering::Relaxed) + 1;
    if received % 10 == 0 {
        tracing::info!(files_received = received, "receiving instances");
    }
    Ok(output_path)
}

fn create_cstore_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

fn create_cecho_response(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8030])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
    ])
}

/// Returns `None` if source is [dicom::ul::pdu::reader::Error::NoPduAvailable]
fn bubble_no_pdu(
    pdu: Result<Pdu, dicom::ul::association::server::Error>,
) -> Result<Option<Pdu>, dicom::ul::association::server::Error> {
    pdu.map(Some).or_else(|e| {
        if let dicom::ul::association::server::Error::Receive { source } = &e {
            if matches!(source, dicom::ul::pdu::reader::Error::NoPduAvailable { .. }) {
                Ok(None)
            } else {
                Err(e)
            }
        } else {
            Err(e)
        }
    })
}
