//! Projection of native records into the VM.
//!
//! Every exposed type gets a lazily built type record in the VM registry
//! (keyed by its type name) holding the class table at slot 1, the
//! weak-valued instance registry at slot 2 and, for singletons, the global
//! instance at slot 3. Each userdata carries its own environment table
//! (user value 1) used as a property bag; push-this types also carry their
//! ref id (user value 2).
//!
//! Lookup order for `obj.key`: instance environment, class table, then the
//! type's own `index`. Writes check the class table for a type match, then
//! run the type's `newindex`, which either consumes the value or hands it
//! back to be stored in the environment.
//!
//! Metatables carry the type name in `__name`; reflection reports that name
//! instead of the metatable. Types that opt into `FINALIZE` get a guard
//! table (user value 3) whose `__gc` runs `finalize` before the collector
//! destroys the instance.

use mlua::{
    AnyUserData, FromLuaMulti, Function, IntoLuaMulti, Lua, MetaMethod, MultiValue, Table,
    UserData, UserDataFields, UserDataMethods, Value,
};

use crate::error::{DeckError, LuaResult};

const SLOT_CLASS: i64 = 1;
const SLOT_INSTANCES: i64 = 2;
const SLOT_SINGLETON: i64 = 3;
const SLOT_FINALIZER: i64 = 4;
const NEXT_REF_ID: &str = "next_ref_id";

const UV_ENV: usize = 1;
const UV_REF_ID: usize = 2;
const UV_FINALIZER: usize = 3;

/// Builds a guard whose collection finalizes `ud`. The guard reaches `ud`
/// only through a Lua upvalue, so the pair stays collectable. The guard's
/// `__gc` is registered after the userdata's own, so it runs first.
const FINALIZER_SRC: &str = r#"
local run = ...
return function(ud)
    return setmetatable({}, { __gc = function() run(ud) end })
end
"#;

/// What a type's `newindex` did with an assignment.
pub enum NewIndex {
    Handled,
    Store(Value),
}

pub trait LuaClass: Sized + 'static {
    const TYPE_NAME: &'static str;
    /// Register every instance in the instance registry under a ref id.
    const PUSH_THIS: bool = false;
    /// The first construction becomes the VM-wide instance.
    const SINGLETON: bool = false;
    /// Run `finalize` on `__close` or before the collector destroys the
    /// instance.
    const FINALIZE: bool = false;

    fn init_class_table(_lua: &Lua, _class: &Table) -> LuaResult<()> {
        Ok(())
    }

    fn init_instance_table(&mut self, _lua: &Lua, _env: &Table) -> LuaResult<()> {
        Ok(())
    }

    fn index(&self, _lua: &Lua, _key: &str) -> LuaResult<Value> {
        Ok(Value::Nil)
    }

    fn index_int(&self, _lua: &Lua, _key: i64) -> LuaResult<Value> {
        Ok(Value::Nil)
    }

    fn newindex(&mut self, _lua: &Lua, _key: &str, value: Value) -> LuaResult<NewIndex> {
        Ok(NewIndex::Store(value))
    }

    fn tostring(&self) -> String {
        Self::TYPE_NAME.to_string()
    }

    fn equals(&self, _other: &Self) -> bool {
        false
    }

    fn len(&self) -> LuaResult<i64> {
        Err(DeckError::arg_type(format!("attempt to get length of a {} value", Self::TYPE_NAME)).into())
    }

    fn call(_lua: &Lua, _this: &AnyUserData, _args: MultiValue) -> LuaResult<MultiValue> {
        Err(DeckError::arg_type(format!("attempt to call a {} value", Self::TYPE_NAME)).into())
    }

    /// Releases native resources. Runs at most once per instance.
    fn finalize(&mut self, _lua: &Lua) {}
}

/// Implements `mlua::UserData` for a `LuaClass` by routing every metamethod
/// through the bridge.
#[macro_export]
macro_rules! lua_class {
    ($ty:ty) => {
        impl mlua::UserData for $ty {
            fn add_fields<F: mlua::UserDataFields<Self>>(fields: &mut F) {
                $crate::bridge::add_bridge_fields::<Self, F>(fields);
            }

            fn add_methods<M: mlua::UserDataMethods<Self>>(methods: &mut M) {
                $crate::bridge::add_bridge_methods::<Self, M>(methods);
            }
        }
    };
}

pub fn add_bridge_fields<T: LuaClass + UserData, F: UserDataFields<T>>(fields: &mut F) {
    fields.add_meta_field("__name", T::TYPE_NAME);
}

pub fn add_bridge_methods<T: LuaClass + UserData, M: UserDataMethods<T>>(methods: &mut M) {
    methods.add_meta_function(
        MetaMethod::Index,
        |lua, (ud, key): (AnyUserData, Value)| index::<T>(lua, &ud, key),
    );
    methods.add_meta_function(
        MetaMethod::NewIndex,
        |lua, (ud, key, value): (AnyUserData, Value, Value)| newindex::<T>(lua, &ud, key, value),
    );
    methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.tostring()));
    methods.add_meta_function(MetaMethod::Eq, |_, (a, b): (Value, Value)| {
        let (Value::UserData(a), Value::UserData(b)) = (a, b) else {
            return Ok(false);
        };
        if !a.is::<T>() || !b.is::<T>() {
            return Ok(false);
        }
        if a == b {
            return Ok(true);
        }
        let a = a.borrow::<T>()?;
        let b = b.borrow::<T>()?;
        Ok(a.equals(&b))
    });
    methods.add_meta_method(MetaMethod::Len, |_, this, ()| this.len());
    methods.add_meta_function(MetaMethod::Call, |lua, (ud, args): (AnyUserData, MultiValue)| {
        T::call(lua, &ud, args)
    });
    if T::FINALIZE {
        methods.add_meta_function(MetaMethod::Close, |lua, (ud, _err): (AnyUserData, Value)| {
            run_finalizer::<T>(lua, &ud)
        });
    }
}

fn type_info<T: LuaClass>(lua: &Lua) -> LuaResult<Table> {
    if let Some(info) = lua.named_registry_value::<Option<Table>>(T::TYPE_NAME)? {
        return Ok(info);
    }
    let class = lua.create_table()?;
    let instances = weak_table(lua, "v")?;
    let info = lua.create_table()?;
    info.raw_set(SLOT_CLASS, class.clone())?;
    info.raw_set(SLOT_INSTANCES, instances)?;
    info.raw_set(NEXT_REF_ID, 1)?;
    if T::FINALIZE {
        let run = lua.create_function(|lua, ud: AnyUserData| run_finalizer::<T>(lua, &ud))?;
        let make_guard: Function = lua
            .load(FINALIZER_SRC)
            .set_name("=deck:finalizer")
            .call(run)?;
        info.raw_set(SLOT_FINALIZER, make_guard)?;
    }
    // Register before initializing so class initializers may refer back.
    lua.set_named_registry_value(T::TYPE_NAME, info.clone())?;
    T::init_class_table(lua, &class)?;
    Ok(info)
}

/// Runs `T::finalize` once. Instances already destroyed or currently
/// borrowed are skipped.
fn run_finalizer<T: LuaClass>(lua: &Lua, ud: &AnyUserData) -> LuaResult<()> {
    let Some(guard) = ud.nth_user_value::<Option<Table>>(UV_FINALIZER)? else {
        return Ok(());
    };
    if guard.raw_get::<bool>("done")? {
        return Ok(());
    }
    guard.raw_set("done", true)?;
    match ud.borrow_mut::<T>() {
        Ok(mut this) => this.finalize(lua),
        Err(err) => tracing::debug!(type_name = T::TYPE_NAME, error = %err, "finalizer skipped"),
    }
    Ok(())
}

/// The type name stored in a bridged userdata's metatable.
pub fn userdata_type_name(ud: &AnyUserData) -> Option<String> {
    ud.metatable().ok()?.get::<Option<String>>("__name").ok()?
}

pub fn weak_table(lua: &Lua, mode: &str) -> LuaResult<Table> {
    let t = lua.create_table()?;
    let mt = lua.create_table()?;
    mt.raw_set("__mode", mode)?;
    t.set_metatable(Some(mt));
    Ok(t)
}

pub fn class_table<T: LuaClass>(lua: &Lua) -> LuaResult<Table> {
    type_info::<T>(lua)?.raw_get(SLOT_CLASS)
}

pub fn instance_registry<T: LuaClass>(lua: &Lua) -> LuaResult<Table> {
    type_info::<T>(lua)?.raw_get(SLOT_INSTANCES)
}

/// Wraps `value` as a new userdata with its own environment table.
/// For singleton types an existing instance is returned instead.
pub fn push_new<T: LuaClass + UserData>(lua: &Lua, value: T) -> LuaResult<AnyUserData> {
    let info = type_info::<T>(lua)?;
    if T::SINGLETON {
        if let Some(existing) = info.raw_get::<Option<AnyUserData>>(SLOT_SINGLETON)? {
            return Ok(existing);
        }
    }

    let ud = lua.create_userdata(value)?;
    let env = lua.create_table()?;
    ud.set_nth_user_value(UV_ENV, env.clone())?;
    ud.borrow_mut::<T>()?.init_instance_table(lua, &env)?;

    if T::PUSH_THIS || T::SINGLETON {
        let id: i64 = info.raw_get(NEXT_REF_ID)?;
        info.raw_set(NEXT_REF_ID, id + 1)?;
        let instances: Table = info.raw_get(SLOT_INSTANCES)?;
        instances.raw_set(id, ud.clone())?;
        ud.set_nth_user_value(UV_REF_ID, id)?;
    }
    if T::SINGLETON {
        info.raw_set(SLOT_SINGLETON, ud.clone())?;
    }
    if T::FINALIZE {
        let make_guard: Function = info.raw_get(SLOT_FINALIZER)?;
        let guard: Table = make_guard.call(ud.clone())?;
        ud.set_nth_user_value(UV_FINALIZER, guard)?;
    }
    Ok(ud)
}

pub fn global_instance<T: LuaClass>(lua: &Lua) -> LuaResult<Option<AnyUserData>> {
    type_info::<T>(lua)?.raw_get(SLOT_SINGLETON)
}

pub fn ref_id(ud: &AnyUserData) -> LuaResult<Option<i64>> {
    ud.nth_user_value(UV_REF_ID)
}

/// Recovers a live instance from its ref id.
pub fn from_ref_id<T: LuaClass>(lua: &Lua, id: i64) -> LuaResult<Option<AnyUserData>> {
    instance_registry::<T>(lua)?.raw_get(id)
}

pub fn instance_env(ud: &AnyUserData) -> LuaResult<Table> {
    ud.nth_user_value(UV_ENV)
}

/// Checks that `value` is a userdata of type `T` (TypeError otherwise).
pub fn check<T: LuaClass>(value: &Value) -> LuaResult<AnyUserData> {
    match value {
        Value::UserData(ud) if ud.is::<T>() => Ok(ud.clone()),
        other => Err(DeckError::Type {
            expected: T::TYPE_NAME,
            got: type_name_of(other),
        }
        .into()),
    }
}

pub fn is<T: LuaClass>(value: &Value) -> bool {
    matches!(value, Value::UserData(ud) if ud.is::<T>())
}

pub fn type_name_of(value: &Value) -> String {
    value.type_name().to_string()
}

pub fn index<T: LuaClass>(lua: &Lua, ud: &AnyUserData, key: Value) -> LuaResult<Value> {
    let env = instance_env(ud)?;
    let v: Value = env.raw_get(key.clone())?;
    if !v.is_nil() {
        return Ok(v);
    }
    let v: Value = class_table::<T>(lua)?.raw_get(key.clone())?;
    if !v.is_nil() {
        return Ok(v);
    }

    let this = ud.borrow::<T>()?;
    match &key {
        Value::String(s) => this.index(lua, &s.to_str()?),
        Value::Integer(i) => this.index_int(lua, *i),
        Value::Number(n) if n.fract() == 0.0 => this.index_int(lua, *n as i64),
        _ => Ok(Value::Nil),
    }
}

pub fn newindex<T: LuaClass>(lua: &Lua, ud: &AnyUserData, key: Value, value: Value) -> LuaResult<()> {
    let class_value: Value = class_table::<T>(lua)?.raw_get(key.clone())?;
    if !class_value.is_nil() && !value.is_nil() && class_value.type_name() != value.type_name() {
        return Err(DeckError::arg_type(format!(
            "{}: cannot assign {} over {} member",
            T::TYPE_NAME,
            value.type_name(),
            class_value.type_name()
        ))
        .into());
    }

    let env = instance_env(ud)?;
    let Value::String(s) = &key else {
        return env.raw_set(key, value);
    };
    let name = s.to_str()?.to_string();
    if name.starts_with("on_") && !matches!(value, Value::Function(_) | Value::Nil) {
        return Err(DeckError::arg_type(format!(
            "{}.{name} must be a function or nil, got {}",
            T::TYPE_NAME,
            value.type_name()
        ))
        .into());
    }

    let outcome = ud.borrow_mut::<T>()?.newindex(lua, &name, value)?;
    match outcome {
        NewIndex::Handled => Ok(()),
        NewIndex::Store(v) => env.raw_set(name, v),
    }
}

/// Installs `name` in a class table as a method taking `&mut T`.
pub fn method<T, A, R, F>(lua: &Lua, class: &Table, name: &'static str, f: F) -> LuaResult<()>
where
    T: LuaClass + UserData,
    A: FromLuaMulti,
    R: IntoLuaMulti,
    F: Fn(&Lua, &mut T, A) -> LuaResult<R> + 'static,
{
    let func = lua.create_function(move |lua, (this, args): (Value, A)| {
        let ud = check::<T>(&this)?;
        let mut this = ud.borrow_mut::<T>()?;
        f(lua, &mut this, args)
    })?;
    class.raw_set(name, func)
}

/// Installs `name` in a class table as a method receiving the userdata
/// handle itself, for methods that must not hold a borrow while calling
/// back into the VM.
pub fn method_ud<T, A, R, F>(lua: &Lua, class: &Table, name: &'static str, f: F) -> LuaResult<()>
where
    T: LuaClass + UserData,
    A: FromLuaMulti,
    R: IntoLuaMulti,
    F: Fn(&Lua, &AnyUserData, A) -> LuaResult<R> + 'static,
{
    let func = lua.create_function(move |lua, (this, args): (Value, A)| {
        let ud = check::<T>(&this)?;
        f(lua, &ud, args)
    })?;
    class.raw_set(name, func)
}

/// Installs a plain function in a class table.
pub fn function<A, R, F>(lua: &Lua, class: &Table, name: &'static str, f: F) -> LuaResult<()>
where
    A: FromLuaMulti,
    R: IntoLuaMulti,
    F: Fn(&Lua, A) -> LuaResult<R> + 'static,
{
    class.raw_set(name, lua.create_function(f)?)
}

/// Drops a leading `T` receiver so module functions work with both `.` and
/// `:` call syntax.
pub fn strip_self<T: LuaClass>(mut args: MultiValue) -> MultiValue {
    if args.front().is_some_and(is::<T>) {
        args.pop_front();
    }
    args
}

/// Installs a module-level function of singleton `T` that tolerates being
/// called with or without the module as receiver.
pub fn module_function<T, A, R, F>(lua: &Lua, class: &Table, name: &'static str, f: F) -> LuaResult<()>
where
    T: LuaClass,
    A: FromLuaMulti,
    R: IntoLuaMulti,
    F: Fn(&Lua, A) -> LuaResult<R> + 'static,
{
    let func = lua.create_function(move |lua, args: MultiValue| {
        let args = A::from_lua_multi(strip_self::<T>(args), lua)?;
        f(lua, args)
    })?;
    class.raw_set(name, func)
}
