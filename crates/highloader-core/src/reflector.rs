//! Runtime compilation of `.proto` sources into the schema model and into
//! wire-level method descriptors.

use crate::error::SchemaError;
use crate::schema::{
    CallPattern, Enum, Field, FieldType, Message, Method, ParsedSchema, ScalarKind, Service,
};
use prost_reflect::{
    DescriptorPool, FieldDescriptor, FileDescriptor, Kind, MessageDescriptor, MethodDescriptor,
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Parses schema sources. Holds no state besides the import search path,
/// so resolving the same file twice yields structurally equal models.
#[derive(Debug, Clone, Default)]
pub struct SchemaReflector {
    import_paths: Vec<PathBuf>,
}

struct CompiledFile {
    pool: DescriptorPool,
    file: FileDescriptor,
}

impl SchemaReflector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra directories searched for `import` statements, after the
    /// directory containing the schema itself.
    pub fn with_import_paths(import_paths: Vec<PathBuf>) -> Self {
        Self { import_paths }
    }

    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<ParsedSchema, SchemaError> {
        let path = path.as_ref();
        let compiled = self.compile(path)?;
        let file = &compiled.file;

        let services = file
            .services()
            .map(|service| Service {
                name: service.name().to_string(),
                full_name: service.full_name().to_string(),
                methods: service
                    .methods()
                    .map(|method| Method {
                        name: method.name().to_string(),
                        call_pattern: CallPattern::from_streaming(
                            method.is_client_streaming(),
                            method.is_server_streaming(),
                        ),
                        request: build_message(&method.input(), &mut Vec::new()),
                    })
                    .collect(),
            })
            .collect();

        // The schema's own enums first, then those of every imported file.
        let mut enums = Vec::new();
        collect_file_enums(file, &mut enums);
        for other in compiled.pool.files().filter(|f| f.name() != file.name()) {
            collect_file_enums(&other, &mut enums);
        }

        Ok(ParsedSchema {
            services,
            enums,
            package: file.package_name().to_string(),
            source_path: path.to_path_buf(),
        })
    }

    /// Look up the wire descriptor the engine needs to build request messages.
    /// `service` may be fully-qualified or relative to the file's package.
    pub fn find_method_descriptor(
        &self,
        path: impl AsRef<Path>,
        method: &str,
        service: &str,
    ) -> Result<MethodDescriptor, SchemaError> {
        let compiled = self.compile(path.as_ref())?;
        let package = compiled.file.package_name();

        let service_desc = compiled
            .pool
            .get_service_by_name(service)
            .or_else(|| {
                if package.is_empty() || service.is_empty() {
                    None
                } else {
                    compiled
                        .pool
                        .get_service_by_name(&format!("{package}.{service}"))
                }
            })
            .ok_or_else(|| SchemaError::ServiceNotFound(service.to_string()))?;

        let found = service_desc.methods().find(|m| m.name() == method);
        found.ok_or_else(|| SchemaError::MethodNotFound {
            service: service.to_string(),
            method: method.to_string(),
        })
    }

    fn compile(&self, path: &Path) -> Result<CompiledFile, SchemaError> {
        let parse_error = |message: String| SchemaError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut includes = vec![parent];
        includes.extend(self.import_paths.iter().cloned());

        let mut compiler =
            protox::Compiler::new(includes).map_err(|e| parse_error(e.to_string()))?;
        compiler.include_imports(true);
        compiler
            .open_file(path)
            .map_err(|e| parse_error(e.to_string()))?;
        let pool = compiler.descriptor_pool();

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| parse_error("path has no file name".to_string()))?;
        let file = pool
            .get_file_by_name(file_name)
            .or_else(|| pool.files().last())
            .ok_or_else(|| parse_error("no file descriptor produced".to_string()))?;

        debug!(
            "Compiled {:?}: package={:?} services={}",
            path,
            file.package_name(),
            file.services().len()
        );

        Ok(CompiledFile { pool, file })
    }
}

/// Expand a message into the model. A message already present in
/// `ancestors` becomes a field-less stub so self-referencing types terminate.
fn build_message(desc: &MessageDescriptor, ancestors: &mut Vec<String>) -> Message {
    let full_name = desc.full_name().to_string();
    if ancestors.contains(&full_name) {
        return Message {
            name: desc.name().to_string(),
            full_name,
            fields: Vec::new(),
            recursive: true,
        };
    }

    ancestors.push(full_name.clone());
    let fields = desc
        .fields()
        .map(|field| build_field(&field, ancestors))
        .collect();
    ancestors.pop();

    Message {
        name: desc.name().to_string(),
        full_name,
        fields,
        recursive: false,
    }
}

fn build_field(field: &FieldDescriptor, ancestors: &mut Vec<String>) -> Field {
    let (field_type, message, enum_name) = if field.is_map() {
        (FieldType::Map, None, None)
    } else {
        match field.kind() {
            Kind::Message(nested) => (
                FieldType::Message,
                Some(Box::new(build_message(&nested, ancestors))),
                None,
            ),
            Kind::Enum(descriptor) => (
                FieldType::Enum,
                None,
                Some(descriptor.full_name().to_string()),
            ),
            Kind::Double => (FieldType::Scalar(ScalarKind::Double), None, None),
            Kind::Float => (FieldType::Scalar(ScalarKind::Float), None, None),
            Kind::Int32 => (FieldType::Scalar(ScalarKind::Int32), None, None),
            Kind::Int64 => (FieldType::Scalar(ScalarKind::Int64), None, None),
            Kind::Uint32 => (FieldType::Scalar(ScalarKind::Uint32), None, None),
            Kind::Uint64 => (FieldType::Scalar(ScalarKind::Uint64), None, None),
            Kind::Sint32 => (FieldType::Scalar(ScalarKind::Sint32), None, None),
            Kind::Sint64 => (FieldType::Scalar(ScalarKind::Sint64), None, None),
            Kind::Fixed32 => (FieldType::Scalar(ScalarKind::Fixed32), None, None),
            Kind::Fixed64 => (FieldType::Scalar(ScalarKind::Fixed64), None, None),
            Kind::Sfixed32 => (FieldType::Scalar(ScalarKind::Sfixed32), None, None),
            Kind::Sfixed64 => (FieldType::Scalar(ScalarKind::Sfixed64), None, None),
            Kind::Bool => (FieldType::Scalar(ScalarKind::Bool), None, None),
            Kind::String => (FieldType::Scalar(ScalarKind::String), None, None),
            Kind::Bytes => (FieldType::Scalar(ScalarKind::Bytes), None, None),
        }
    };

    Field {
        name: field.name().to_string(),
        json_name: field.json_name().to_string(),
        field_type,
        repeated: field.is_list(),
        message,
        enum_name,
    }
}

fn build_enum(desc: &prost_reflect::EnumDescriptor) -> Enum {
    Enum {
        name: desc.name().to_string(),
        full_name: desc.full_name().to_string(),
        values: desc.values().map(|v| v.name().to_string()).collect(),
    }
}

fn collect_file_enums(file: &FileDescriptor, out: &mut Vec<Enum>) {
    for descriptor in file.enums() {
        out.push(build_enum(&descriptor));
    }
    for message in file.messages() {
        collect_nested_enums(&message, out);
    }
}

fn collect_nested_enums(message: &MessageDescriptor, out: &mut Vec<Enum>) {
    for descriptor in message.child_enums() {
        out.push(build_enum(&descriptor));
    }
    for child in message.child_messages() {
        collect_nested_enums(&child, out);
    }
}
