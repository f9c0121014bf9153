//! Named pipe endpoint with an explicit security descriptor

use super::acl::{sddl_for, AccessControl};
use super::{Connection, Endpoint, TransportError};
use std::ffi::c_void;
use std::io;
use std::os::windows::io::AsRawHandle;
use tokio::net::windows::named_pipe::{NamedPipeServer, PipeMode, ServerOptions};
use tracing::{debug, info};
use windows::core::{HSTRING, PCWSTR, PWSTR};
use windows::Win32::Foundation::{LocalFree, BOOL, HANDLE, HLOCAL};
use windows::Win32::Security::Authorization::{
    ConvertSidToStringSidW, ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use windows::Win32::Security::{
    LookupAccountNameW, PSECURITY_DESCRIPTOR, PSID, SECURITY_ATTRIBUTES, SID_NAME_USE,
};
use windows::Win32::System::Pipes::GetNamedPipeClientProcessId;

const PIPE_BUFFER_SIZE: u32 = 65536;
const ERROR_ACCESS_DENIED: i32 = 5;

/// Self-relative descriptor allocated by the SDDL parser.
struct SecurityDescriptor(PSECURITY_DESCRIPTOR);

// The descriptor is read-only after creation.
unsafe impl Send for SecurityDescriptor {}
unsafe impl Sync for SecurityDescriptor {}

impl SecurityDescriptor {
    fn from_sddl(sddl: &str) -> Result<Self, TransportError> {
        let mut descriptor = PSECURITY_DESCRIPTOR::default();
        // SAFETY: the SDDL string outlives the call and `descriptor` is a
        // valid out-pointer; the allocation is released in Drop.
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                &HSTRING::from(sddl),
                SDDL_REVISION_1,
                &mut descriptor,
                None,
            )
        }
        .map_err(|e| TransportError::Acl(format!("invalid descriptor {}: {}", sddl, e)))?;
        Ok(Self(descriptor))
    }
}

impl Drop for SecurityDescriptor {
    fn drop(&mut self) {
        // SAFETY: allocated with LocalAlloc by the SDDL parser.
        unsafe {
            let _ = LocalFree(HLOCAL(self.0 .0));
        }
    }
}

pub struct PlatformListener {
    pipe_name: String,
    server: NamedPipeServer,
    descriptor: SecurityDescriptor,
}

impl PlatformListener {
    /// Create the first pipe instance, failing if another process owns the
    /// name.
    pub fn bind(endpoint: &Endpoint, acl: &AccessControl) -> Result<Self, TransportError> {
        let pipe_name = endpoint.pipe_name();

        let sids = acl
            .groups()
            .iter()
            .map(|group| lookup_sid(group))
            .collect::<Result<Vec<_>, _>>()?;
        let sddl = sddl_for(&sids);
        debug!("Pipe security descriptor: {}", sddl);
        let descriptor = SecurityDescriptor::from_sddl(&sddl)?;

        let server = create_instance(&pipe_name, &descriptor, true).map_err(|e| {
            if e.raw_os_error() == Some(ERROR_ACCESS_DENIED) {
                TransportError::InUse(pipe_name.clone())
            } else {
                TransportError::Io {
                    endpoint: pipe_name.clone(),
                    source: e,
                }
            }
        })?;

        info!("Listening on {}", pipe_name);
        Ok(Self {
            pipe_name,
            server,
            descriptor,
        })
    }

    /// Wait for a client on the current instance, then queue a fresh one.
    pub async fn accept(&mut self) -> io::Result<Incoming> {
        self.server.connect().await?;
        let next = create_instance(&self.pipe_name, &self.descriptor, false)?;
        let connected = std::mem::replace(&mut self.server, next);
        Ok(Incoming { server: connected })
    }

    pub fn address(&self) -> String {
        self.pipe_name.clone()
    }
}

/// A connected pipe instance. The pipe's security descriptor already
/// vetted the client when it opened the pipe.
pub struct Incoming {
    server: NamedPipeServer,
}

impl Incoming {
    pub async fn admit(self) -> io::Result<Connection> {
        let peer = client_process_id(&self.server)
            .map(|pid| format!("pid {}", pid))
            .unwrap_or_else(|| "unknown process".to_string());
        Ok(Connection::pipe(self.server, peer))
    }
}

fn create_instance(
    pipe_name: &str,
    descriptor: &SecurityDescriptor,
    first: bool,
) -> io::Result<NamedPipeServer> {
    let mut attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: descriptor.0 .0,
        bInheritHandle: BOOL(0),
    };
    let mut options = ServerOptions::new();
    options
        .first_pipe_instance(first)
        .pipe_mode(PipeMode::Message)
        .in_buffer_size(PIPE_BUFFER_SIZE)
        .out_buffer_size(PIPE_BUFFER_SIZE);
    // SAFETY: `attributes` and the descriptor it points to are alive for the
    // duration of the call.
    unsafe {
        options.create_with_security_attributes_raw(
            pipe_name,
            &mut attributes as *mut SECURITY_ATTRIBUTES as *mut c_void,
        )
    }
}

fn client_process_id(server: &NamedPipeServer) -> Option<u32> {
    let mut pid = 0u32;
    // SAFETY: the handle belongs to a connected pipe owned by `server`.
    unsafe { GetNamedPipeClientProcessId(HANDLE(server.as_raw_handle()), &mut pid) }.ok()?;
    Some(pid)
}

/// Resolve an account or group name to its string SID.
fn lookup_sid(account: &str) -> Result<String, TransportError> {
    let name = HSTRING::from(account);
    let mut sid_len = 0u32;
    let mut domain_len = 0u32;
    let mut sid_use = SID_NAME_USE::default();

    // First call only reports the buffer sizes.
    // SAFETY: null buffers with zero lengths are the documented size query.
    let _ = unsafe {
        LookupAccountNameW(
            PCWSTR::null(),
            &name,
            PSID::default(),
            &mut sid_len,
            PWSTR::null(),
            &mut domain_len,
            &mut sid_use,
        )
    };
    if sid_len == 0 {
        return Err(TransportError::UnknownPrincipal(account.to_string()));
    }

    let mut sid = vec![0u8; sid_len as usize];
    let mut domain = vec![0u16; domain_len as usize];
    // SAFETY: buffers are sized from the previous call.
    unsafe {
        LookupAccountNameW(
            PCWSTR::null(),
            &name,
            PSID(sid.as_mut_ptr().cast()),
            &mut sid_len,
            PWSTR(domain.as_mut_ptr()),
            &mut domain_len,
            &mut sid_use,
        )
    }
    .map_err(|e| TransportError::UnknownPrincipal(format!("{}: {}", account, e)))?;

    let mut string_sid = PWSTR::null();
    // SAFETY: `sid` holds a valid SID written by LookupAccountNameW.
    unsafe { ConvertSidToStringSidW(PSID(sid.as_mut_ptr().cast()), &mut string_sid) }
        .map_err(|e| TransportError::Acl(format!("SID conversion for {}: {}", account, e)))?;

    // SAFETY: `string_sid` is a NUL-terminated LocalAlloc'd string.
    let converted = unsafe { string_sid.to_string() };
    unsafe {
        let _ = LocalFree(HLOCAL(string_sid.0.cast()));
    }
    converted.map_err(|e| TransportError::Acl(format!("SID for {}: {}", account, e)))
}
