//! Property tests for argument rearrangement: the output arrangement
//! must match a simple model of the positional/defaults/varargs rules
//! for every spec combination, and every error case must be a TypeError.

use proptest::prelude::*;

use quickening::dispatch::args::{rearrange_arguments, ArgPassSpec, ParamReceiveSpec};
use quickening::objects::{
    self, box_int, builtins, new_function, py_elements, unbox_int, PyFunction, PyObject,
};

extern "C" fn dummy_entry(
    _f: *mut PyFunction,
    _a: *mut PyObject,
    _b: *mut PyObject,
    _c: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    objects::box_int(0)
}

fn make_function(n_recv: usize, defaults: &[*mut PyObject], varargs: bool) -> *mut PyObject {
    let names: Vec<String> = (0..n_recv).map(|i| format!("p{}", i)).collect();
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    new_function("model_fn", dummy_entry, n_recv as u32, varargs, false, &name_refs, defaults)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn positional_rearrangement_matches_model(
        n_pass in 0usize..6,
        n_recv in 0usize..6,
        n_def in 0usize..4,
        varargs in any::<bool>(),
    ) {
        prop_assume!(n_def <= n_recv);

        let passed: Vec<*mut PyObject> = (0..n_pass).map(|i| box_int(i as i64)).collect();
        let defaults: Vec<*mut PyObject> =
            (0..n_def).map(|i| box_int(1000 + i as i64)).collect();
        let func = make_function(n_recv, &defaults, varargs) as *mut PyFunction;

        let a1 = passed.first().copied().unwrap_or(std::ptr::null_mut());
        let a2 = passed.get(1).copied().unwrap_or(std::ptr::null_mut());
        let a3 = passed.get(2).copied().unwrap_or(std::ptr::null_mut());
        let mut rest: Vec<*mut PyObject> = passed.iter().skip(3).copied().collect();

        let paramspec = ParamReceiveSpec::new(n_recv, n_def, varargs, false);
        let mut rewrite_success = false;
        let param_names = unsafe { (*func).param_names.clone() };
        let result = rearrange_arguments(
            paramspec,
            Some(&param_names),
            func,
            &defaults,
            None,
            &mut rewrite_success,
            ArgPassSpec::positional(n_pass),
            a1,
            a2,
            a3,
            if rest.is_empty() {
                std::ptr::null_mut()
            } else {
                rest.as_mut_ptr()
            },
            None,
        );

        if !varargs && n_pass > n_recv {
            let err = result.unwrap_err();
            prop_assert_eq!(err.exc_type, builtins().type_error);
            prop_assert!(err.message.contains("takes at most"));
        } else if n_pass + n_def < n_recv {
            let err = result.unwrap_err();
            prop_assert_eq!(err.exc_type, builtins().type_error);
        } else {
            let output = result.unwrap();
            prop_assert_eq!(output.len(), paramspec.total_received());

            // Positionals land in order.
            for i in 0..n_pass.min(n_recv) {
                prop_assert_eq!(output[i], passed[i]);
            }
            // Defaults fill the tail of the declared parameters.
            for i in n_pass.max(n_recv - n_def)..n_recv {
                let default_idx = i + n_def - n_recv;
                prop_assert_eq!(unbox_int(output[i]), 1000 + default_idx as i64);
            }
            // Overflow goes into the varargs tuple.
            if varargs {
                let tuple = output[n_recv];
                let elts = py_elements(tuple).expect("varargs is a tuple");
                prop_assert_eq!(elts.len(), n_pass.saturating_sub(n_recv));
                for (j, &e) in elts.iter().enumerate() {
                    prop_assert_eq!(e, passed[n_recv + j]);
                }
            }

            for p in output {
                unsafe { objects::decref(p) };
            }
        }

        unsafe {
            for p in passed {
                objects::decref(p);
            }
            for d in defaults {
                objects::decref(d);
            }
            objects::decref(func as *mut PyObject);
        }
    }
}

#[test]
fn exact_match_is_a_passthrough() {
    let passed: Vec<*mut PyObject> = (0..2).map(|i| box_int(i)).collect();
    let defaults = [];
    let func = make_function(2, &defaults, false) as *mut PyFunction;
    let param_names = unsafe { (*func).param_names.clone() };

    let mut rewrite_success = false;
    let output = rearrange_arguments(
        ParamReceiveSpec::new(2, 0, false, false),
        Some(&param_names),
        func,
        &defaults,
        None,
        &mut rewrite_success,
        ArgPassSpec::positional(2),
        passed[0],
        passed[1],
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        None,
    )
    .unwrap();
    assert_eq!(output, passed);

    unsafe {
        for p in output {
            objects::decref(p);
        }
        for p in passed {
            objects::decref(p);
        }
        objects::decref(func as *mut PyObject);
    }
}
