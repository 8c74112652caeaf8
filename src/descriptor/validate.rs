//! Contract validation. Pure: checks run in a fixed order and report the
//! first violation with enough context (interface, method, parameter) to
//! localize it. Validation happens once per descriptor, at registration.

use super::{InterfaceDescriptor, MethodDescriptor, ParamDescriptor, ParamType, ReturnKind};
use crate::error::Error;
use crate::marshal;

pub(super) fn validate(desc: &InterfaceDescriptor) -> Result<(), Error> {
    if desc.iid.is_nil() {
        return Err(Error::contract(
            &desc.name,
            "interop interfaces must carry a non-nil interface id",
        ));
    }
    if desc.direction.is_empty() {
        return Err(Error::contract(
            &desc.name,
            "at least one marshal direction must be permitted",
        ));
    }

    // Method names must be unambiguous across the flattened base + own list,
    // since dispatch by name takes the first match.
    for (i, m) in desc.methods.iter().enumerate() {
        if desc.methods[..i].iter().any(|p| p.name == m.name) {
            return Err(Error::contract(
                format!("{}::{}", desc.name, m.name),
                "duplicate method name; overloads are not supported",
            ));
        }
    }

    for m in &desc.methods {
        validate_method(desc, m)?;
    }
    Ok(())
}

fn validate_method(desc: &InterfaceDescriptor, method: &MethodDescriptor) -> Result<(), Error> {
    let ctx = || format!("{}::{}", desc.name, method.name);

    if let Some(rv) = &method.retval {
        if method.ret != ReturnKind::Void {
            return Err(Error::contract(
                ctx(),
                "a method returning its value through an output slot must use the status-code return convention",
            ));
        }
        if rv.index > method.params.len() {
            return Err(Error::contract(
                ctx(),
                format!(
                    "return-value slot index {} is past the end of the parameter list",
                    rv.index
                ),
            ));
        }
        check_out_representable(&ctx(), "return value", &rv.ty)?;
    }

    if let ReturnKind::Interface(iid) = method.ret {
        if iid.is_nil() {
            return Err(Error::contract(
                ctx(),
                "interface-typed return requires a non-nil interface id",
            ));
        }
    }

    for p in &method.params {
        validate_param(desc, method, p)?;
    }
    Ok(())
}

fn validate_param(
    desc: &InterfaceDescriptor,
    method: &MethodDescriptor,
    param: &ParamDescriptor,
) -> Result<(), Error> {
    let ctx = format!("{}::{}({})", desc.name, method.name, param.name);

    if param.direction.is_empty() {
        return Err(Error::contract(ctx, "parameter declares no direction"));
    }

    if param.direction.contains(super::ParamDirection::OUT) {
        check_out_representable(&ctx, "by-reference parameter", &param.ty)?;
    }

    // Resolution either finds a marshaler (which then vets the parameter
    // shape itself), confirms the direct native representation, or fails for
    // an unregistered tag. All three outcomes are contract-time.
    match marshal::resolve(param) {
        Ok(Some(m)) => m.validate(desc.name(), method, param),
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    }
}

/// By-reference values must be representable behind a pointer the native
/// side can write through: scalars, interop interfaces, or the special
/// marshalers. Arbitrary local reference types cannot cross by reference.
fn check_out_representable(ctx: &str, what: &str, ty: &ParamType) -> Result<(), Error> {
    match ty {
        ParamType::NativeString => Err(Error::contract(
            ctx,
            format!("{what} cannot be a native string; strings cross one way only"),
        )),
        ParamType::InterfaceArray(_) => Err(Error::contract(
            ctx,
            format!("{what} cannot be an interface array; arrays cross one way only"),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use crate::descriptor::{
        InterfaceDescriptor, MarshalDirection, MethodDescriptor, ParamDirection, ParamType,
        ReturnKind,
    };
    use crate::error::Error;

    #[test]
    fn rejects_malformed_iid() {
        let err = InterfaceDescriptor::builder("IBroken", "not-a-guid")
            .method(MethodDescriptor::new("nop"))
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::Contract { .. }), "{err}");
    }

    #[test]
    fn rejects_nil_iid() {
        let err = InterfaceDescriptor::builder("INil", "00000000-0000-0000-0000-000000000000")
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[test]
    fn rejects_duplicate_method_names() {
        let err = InterfaceDescriptor::builder("IDup", "6f1d1c3e-0001-4a01-9d2a-55aa01020301")
            .method(MethodDescriptor::new("go"))
            .method(MethodDescriptor::new("go"))
            .register()
            .unwrap_err();
        let Error::Contract { context, .. } = &err else {
            panic!("expected contract error, got {err}");
        };
        assert!(context.contains("IDup::go"));
    }

    #[test]
    fn rejects_output_native_string() {
        let err = InterfaceDescriptor::builder("IStr", "6f1d1c3e-0002-4a01-9d2a-55aa01020302")
            .method(
                MethodDescriptor::new("name").output("value", ParamType::NativeString),
            )
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[test]
    fn rejects_retval_with_pointer_return() {
        let err = InterfaceDescriptor::builder("IRet", "6f1d1c3e-0003-4a01-9d2a-55aa01020303")
            .method(
                MethodDescriptor::new("get")
                    .returns(ReturnKind::Pointer)
                    .ret_via(0, ParamType::I32),
            )
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[test]
    fn rejects_unregistered_marshal_tag() {
        let err = InterfaceDescriptor::builder("ITag", "6f1d1c3e-0004-4a01-9d2a-55aa01020304")
            .method(
                MethodDescriptor::new("custom")
                    .input("value", ParamType::Tagged("no-such-marshaler")),
            )
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::Marshal { .. }), "{err}");
    }

    #[test]
    fn rejects_empty_direction_policy() {
        let err = InterfaceDescriptor::builder("INone", "6f1d1c3e-0005-4a01-9d2a-55aa01020305")
            .direction(MarshalDirection::empty())
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[test]
    fn same_shape_reregistration_returns_existing() {
        let build = || {
            InterfaceDescriptor::builder("ITwice", "6f1d1c3e-0006-4a01-9d2a-55aa01020306")
                .method(
                    MethodDescriptor::new("poke")
                        .param("value", ParamType::I32, ParamDirection::IN),
                )
                .register()
        };
        let a = build().unwrap();
        let b = build().unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_shape_reregistration_is_rejected() {
        let iid = "6f1d1c3e-0007-4a01-9d2a-55aa01020307";
        InterfaceDescriptor::builder("IShape", iid)
            .method(MethodDescriptor::new("one"))
            .register()
            .unwrap();
        let err = InterfaceDescriptor::builder("IShape", iid)
            .method(MethodDescriptor::new("two"))
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }
}
